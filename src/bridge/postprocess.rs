//! Placeholder substitution on script replies.

/// Values substituted into a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
    /// `{self}` and `{nick}`.
    pub nick: String,
    pub uid: String,
    pub gid: String,
    pub card: String,
    pub pc: String,
}

impl Placeholders {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "self" | "nick" => Some(self.nick.as_str()),
            "uid" => Some(self.uid.as_str()),
            "gid" => Some(self.gid.as_str()),
            "card" => Some(self.card.as_str()),
            "pc" => Some(self.pc.as_str()),
            _ => None,
        }
    }
}

/// Replace known `{name}` placeholders in one pass.
///
/// Substituted text is never rescanned, and unknown or unterminated braces
/// are copied through unchanged.
pub fn render(text: &str, values: &Placeholders) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after
            .find('}')
            .and_then(|close| values.lookup(&after[..close]).map(|v| (v, close)));
        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Placeholders {
        Placeholders {
            nick: "Kai".to_string(),
            uid: "u1".to_string(),
            gid: "g1".to_string(),
            card: "Alice".to_string(),
            pc: "Alice".to_string(),
        }
    }

    #[test]
    fn test_all_placeholders() {
        let out = render("{self}/{nick} {uid}@{gid}: {card} ({pc})", &values());
        assert_eq!(out, "Kai/Kai u1@g1: Alice (Alice)");
    }

    #[test]
    fn test_unknown_and_unterminated_braces() {
        assert_eq!(render("{hp} {nick", &values()), "{hp} {nick");
        assert_eq!(render("{{nick}}", &values()), "{Kai}");
        assert_eq!(render("", &values()), "");
    }

    #[test]
    fn test_substitution_is_not_rescanned() {
        let mut v = values();
        v.nick = "{uid}".to_string();
        assert_eq!(render("{nick}", &v), "{uid}");
    }

    #[test]
    fn test_repeated_and_unicode() {
        assert_eq!(render("宠爱:{pc}{pc}", &values()), "宠爱:AliceAlice");
    }
}
