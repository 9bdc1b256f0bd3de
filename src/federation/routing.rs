//! Inbox routing optimization
//!
//! Collapses a recipient set into the minimal set of HTTP requests by
//! preferring shared inboxes. One request per distinct shared-inbox
//! URL is assumed to reach every recipient whose shared inbox matches,
//! which turns broad fan-out (public posts with many followers on the
//! same server) from N deliveries into O(distinct domains).

use std::collections::HashSet;

use super::resolver::url_domain;

/// A delivery recipient as seen by the optimizer.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub actor_uri: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
}

/// Collapse recipients into target inbox URLs.
///
/// Recipients advertising a shared inbox are folded into one request
/// per distinct shared-inbox URL. Recipients without one are delivered
/// to individually, unless their domain is already covered by a chosen
/// shared inbox. Order follows first appearance in the input.
pub fn collapse_inboxes(recipients: &[Recipient]) -> Vec<String> {
    let mut targets = Vec::new();
    let mut chosen_shared = HashSet::new();
    let mut covered_domains = HashSet::new();

    for recipient in recipients {
        if let Some(shared) = &recipient.shared_inbox_url {
            if chosen_shared.insert(shared.clone()) {
                if let Some(domain) = url_domain(shared) {
                    covered_domains.insert(domain);
                }
                targets.push(shared.clone());
            }
        }
    }

    let mut chosen_personal = HashSet::new();
    for recipient in recipients {
        if recipient.shared_inbox_url.is_some() {
            continue;
        }
        let domain = url_domain(&recipient.inbox_url);
        if domain.is_some_and(|domain| covered_domains.contains(&domain)) {
            continue;
        }
        if chosen_personal.insert(recipient.inbox_url.clone()) {
            targets.push(recipient.inbox_url.clone());
        }
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(actor: &str, inbox: &str, shared: Option<&str>) -> Recipient {
        Recipient {
            actor_uri: actor.to_string(),
            inbox_url: inbox.to_string(),
            shared_inbox_url: shared.map(ToString::to_string),
        }
    }

    #[test]
    fn shared_inbox_collapses_same_server_recipients() {
        let recipients = vec![
            recipient(
                "https://one.example/users/alice",
                "https://one.example/users/alice/inbox",
                Some("https://one.example/inbox"),
            ),
            recipient(
                "https://one.example/users/bob",
                "https://one.example/users/bob/inbox",
                Some("https://one.example/inbox"),
            ),
            recipient(
                "https://two.example/users/carol",
                "https://two.example/users/carol/inbox",
                Some("https://two.example/inbox"),
            ),
        ];

        assert_eq!(
            collapse_inboxes(&recipients),
            vec![
                "https://one.example/inbox".to_string(),
                "https://two.example/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn personal_inbox_kept_when_domain_not_covered() {
        let recipients = vec![
            recipient(
                "https://one.example/users/alice",
                "https://one.example/users/alice/inbox",
                Some("https://one.example/inbox"),
            ),
            recipient(
                "https://three.example/users/dave",
                "https://three.example/users/dave/inbox",
                None,
            ),
        ];

        assert_eq!(
            collapse_inboxes(&recipients),
            vec![
                "https://one.example/inbox".to_string(),
                "https://three.example/users/dave/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn personal_inbox_dropped_when_domain_covered_by_shared() {
        let recipients = vec![
            recipient(
                "https://one.example/users/alice",
                "https://one.example/users/alice/inbox",
                Some("https://one.example/inbox"),
            ),
            recipient(
                "https://one.example/users/bob",
                "https://one.example/users/bob/inbox",
                None,
            ),
        ];

        assert_eq!(
            collapse_inboxes(&recipients),
            vec!["https://one.example/inbox".to_string()]
        );
    }

    #[test]
    fn duplicate_personal_inboxes_are_deduplicated() {
        let recipients = vec![
            recipient(
                "https://one.example/users/alice",
                "https://one.example/users/alice/inbox",
                None,
            ),
            recipient(
                "https://one.example/users/alice",
                "https://one.example/users/alice/inbox",
                None,
            ),
        ];

        assert_eq!(
            collapse_inboxes(&recipients),
            vec!["https://one.example/users/alice/inbox".to_string()]
        );
    }

    #[test]
    fn empty_input_yields_no_targets() {
        assert!(collapse_inboxes(&[]).is_empty());
    }
}
