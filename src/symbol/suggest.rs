/// Fuzzy-match collector for "did you mean" candidates.
///
/// Holds at most three suggestions in fixed buckets. Path-separator matches
/// (`::`) rotate through all three buckets; member-access matches (`.`) only
/// through the last two, so a path match is never fully displaced. Later
/// matches overwrite earlier ones in the same bucket; candidates beyond
/// three are dropped.
pub struct Suggester {
    key: String,
    i: usize,
    j: usize,
    a: Option<String>,
    b: Option<String>,
    c: Option<String>,
}

impl Suggester {
    pub fn new(key: &str) -> Suggester {
        Suggester {
            key: key.to_string(),
            i: 0,
            j: 0,
            a: None,
            b: None,
            c: None,
        }
    }

    pub fn add_item(&mut self, item: &str) {
        if fuzzy_match(item, &self.key, "::") {
            match self.j % 3 {
                0 => self.a = Some(item.to_string()),
                1 => self.b = Some(item.to_string()),
                _ => self.c = Some(item.to_string()),
            }
            self.j += 1;
        } else if fuzzy_match(item, &self.key, ".") {
            if self.i % 2 == 0 {
                self.b = Some(item.to_string());
            } else {
                self.c = Some(item.to_string());
            }
            self.i += 1;
        }
    }

    pub fn suggestions(self) -> Vec<String> {
        [self.a, self.b, self.c].into_iter().flatten().collect()
    }
}

/// Whether `target` contains the last `token`-separated segment of `source`.
fn fuzzy_match(target: &str, source: &str, token: &str) -> bool {
    if target.is_empty() || source.is_empty() {
        return false;
    }
    let keyword = source.rsplit(token).next().unwrap_or(source);
    !keyword.is_empty() && target.contains(keyword)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_on_last_path_segment() {
        let mut s = Suggester::new("mycrate::tim::now");
        s.add_item("mycrate::time::now");
        s.add_item("unrelated::other");
        assert_eq!(s.suggestions(), vec!["mycrate::time::now".to_string()]);
    }

    #[test]
    fn member_access_token_fills_trailing_buckets() {
        let mut s = Suggester::new("conn.write");
        s.add_item("net::conn_writer::write");
        let got = s.suggestions();
        assert_eq!(got, vec!["net::conn_writer::write".to_string()]);
    }

    #[test]
    fn caps_at_three_candidates() {
        let mut s = Suggester::new("a::hit");
        for name in ["x::hit1", "x::hit2", "x::hit3", "x::hit4", "x::hit5"] {
            s.add_item(name);
        }
        let got = s.suggestions();
        assert_eq!(got.len(), 3);
        // Bucket rotation means the fourth and fifth overwrite the first two.
        assert!(got.contains(&"x::hit4".to_string()));
        assert!(got.contains(&"x::hit5".to_string()));
        assert!(got.contains(&"x::hit3".to_string()));
    }

    #[test]
    fn no_match_yields_nothing() {
        let mut s = Suggester::new("alpha::beta");
        s.add_item("gamma::delta");
        assert!(s.suggestions().is_empty());
    }
}
