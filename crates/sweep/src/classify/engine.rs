//! Rule evaluation

use crate::models::{HeaderRecord, Policy, Reason, Verdict};

/// Classify one message.
///
/// Rules are evaluated in order and the first match wins:
/// 1. whitelisted sender address or domain → keep
/// 2. protected keyword in the subject → keep
/// 3. flagged message → keep
/// 4. trigger domain, trigger keyword or List-Unsubscribe header → move
/// 5. anything else → keep
///
/// Keyword matching is a case-insensitive substring test. Trigger domains
/// also match their subdomains. Age is not checked here; the search that
/// produced the candidates already applied it.
pub fn classify(header: &HeaderRecord, policy: &Policy) -> Verdict {
    let uid = header.uid;
    let folder = header.folder.as_str();

    if is_whitelisted(header, policy) {
        return Verdict::keep(uid, folder, Reason::Whitelisted);
    }

    let subject = header.subject.to_lowercase();

    if let Some(keyword) = first_contained(&subject, policy.protected_keywords.iter()) {
        return Verdict::keep(uid, folder, Reason::Protected(keyword.to_string()));
    }

    if header.flagged {
        return Verdict::keep(uid, folder, Reason::Flagged);
    }

    if let Some(domain) = policy
        .trigger_domains
        .iter()
        .find(|d| domain_matches(&header.sender_domain, d))
    {
        return Verdict::move_to_review(uid, folder, Reason::TriggerDomain(domain.clone()));
    }

    if let Some(keyword) = first_contained(&subject, policy.trigger_keywords.iter()) {
        return Verdict::move_to_review(uid, folder, Reason::TriggerKeyword(keyword.to_string()));
    }

    if header.has_unsubscribe {
        return Verdict::move_to_review(uid, folder, Reason::ListUnsubscribe);
    }

    Verdict::keep(uid, folder, Reason::NoMatch)
}

fn is_whitelisted(header: &HeaderRecord, policy: &Policy) -> bool {
    (!header.sender.is_empty() && policy.whitelist.contains(&header.sender))
        || (!header.sender_domain.is_empty() && policy.whitelist.contains(&header.sender_domain))
}

fn first_contained<'a>(
    haystack: &str,
    mut keywords: impl Iterator<Item = &'a String>,
) -> Option<&'a str> {
    keywords
        .find(|kw| haystack.contains(kw.as_str()))
        .map(String::as_str)
}

/// Whether `domain` equals `listed` or is a subdomain of it.
///
/// Both sides are expected lower-case. `notpromo.com` does not match
/// `promo.com`.
pub fn domain_matches(domain: &str, listed: &str) -> bool {
    if domain.is_empty() || listed.is_empty() {
        return false;
    }
    domain == listed
        || domain
            .strip_suffix(listed)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
