//! Transport subject naming: `{prefix}{kind}.{name}`.

use std::fmt;

/// Delivery kind encoded in a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// Request/reply, load-shared across a queue group.
    Call,
    /// Fire-and-forget, delivered to exactly one queue-group member.
    Queue,
    /// Fire-and-forget, broadcast to every subscriber.
    Event,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 3] = [SubjectKind::Call, SubjectKind::Queue, SubjectKind::Event];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Call => "call",
            SubjectKind::Queue => "queue",
            SubjectKind::Event => "event",
        }
    }

    /// Whether subscribers of this kind join a shared queue group.
    #[must_use]
    pub fn is_load_shared(self) -> bool {
        !matches!(self, SubjectKind::Event)
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the wire subject for `name` under the given bus prefix.
///
/// The prefix is used verbatim (no separator is inserted), so `"app."` with
/// `Call` and `"user.get"` yields `"app.call.user.get"`.
#[must_use]
pub fn subject(prefix: &str, kind: SubjectKind, name: &str) -> String {
    let kind = kind.as_str();
    let mut out = String::with_capacity(prefix.len() + kind.len() + 1 + name.len());
    out.push_str(prefix);
    out.push_str(kind);
    out.push('.');
    out.push_str(name);
    out
}

/// Splits a subject built by [`subject`] back into its kind and name.
///
/// Returns `None` if the subject does not start with `prefix`, names an
/// unknown kind, or has an empty name.
#[must_use]
pub fn parse_subject<'a>(prefix: &str, subject: &'a str) -> Option<(SubjectKind, &'a str)> {
    let rest = subject.strip_prefix(prefix)?;
    let (kind, name) = rest.split_once('.')?;
    let kind = SubjectKind::ALL.into_iter().find(|k| k.as_str() == kind)?;
    if name.is_empty() {
        return None;
    }
    Some((kind, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix() {
        assert_eq!(subject("", SubjectKind::Call, "user.get"), "call.user.get");
        assert_eq!(subject("", SubjectKind::Queue, "mail.send"), "queue.mail.send");
        assert_eq!(subject("", SubjectKind::Event, "user.created"), "event.user.created");
    }

    #[test]
    fn prefix_is_prepended_verbatim() {
        assert_eq!(subject("app.", SubjectKind::Call, "user.get"), "app.call.user.get");
        assert_eq!(subject("tenant-", SubjectKind::Event, "x"), "tenant-event.x");
    }

    #[test]
    fn parse_reverses_subject() {
        for kind in SubjectKind::ALL {
            let built = subject("app.", kind, "user.get");
            assert_eq!(parse_subject("app.", &built), Some((kind, "user.get")));
        }
    }

    #[test]
    fn parse_rejects_foreign_subjects() {
        assert_eq!(parse_subject("app.", "other.call.x"), None);
        assert_eq!(parse_subject("", "reply.x"), None);
        assert_eq!(parse_subject("", "call."), None);
        assert_eq!(parse_subject("", "call"), None);
    }

    #[test]
    fn only_event_is_broadcast() {
        assert!(SubjectKind::Call.is_load_shared());
        assert!(SubjectKind::Queue.is_load_shared());
        assert!(!SubjectKind::Event.is_load_shared());
    }
}
