//! `--stop-before/--stop-after/--resume-before/--resume-after` bracketing.

use serde_json::Value;
use serde_json_path::JsonPath;

use crate::selector::{path_holds, SelectorError};

/// Cuts a list down to the window between a resume and a stop condition.
#[derive(Debug, Clone, Default)]
pub struct Bracket {
    pub stop_before: Option<JsonPath>,
    pub stop_after: Option<JsonPath>,
    pub resume_before: Option<JsonPath>,
    pub resume_after: Option<JsonPath>,
}

fn parse(path: Option<&str>) -> Result<Option<JsonPath>, SelectorError> {
    path.map(|p| {
        JsonPath::parse(p).map_err(|e| SelectorError::JsonPath {
            path: p.to_string(),
            reason: e.to_string(),
        })
    })
    .transpose()
}

impl Bracket {
    pub fn parse(
        stop_before: Option<&str>,
        stop_after: Option<&str>,
        resume_before: Option<&str>,
        resume_after: Option<&str>,
    ) -> Result<Self, SelectorError> {
        Ok(Self {
            stop_before: parse(stop_before)?,
            stop_after: parse(stop_after)?,
            resume_before: parse(resume_before)?,
            resume_after: parse(resume_after)?,
        })
    }

    /// Keep the items inside the bracket, in order. Without a resume
    /// condition output starts at the first item.
    pub fn apply<T>(&self, items: Vec<T>, record: impl Fn(&T) -> Value) -> Vec<T> {
        let holds = |path: &Option<JsonPath>, doc: &Value| {
            path.as_ref().map(|p| path_holds(p, doc)).unwrap_or(false)
        };
        let mut emitting = self.resume_before.is_none() && self.resume_after.is_none();
        let mut out = Vec::new();

        for item in items {
            let doc = record(&item);
            if !emitting {
                if holds(&self.resume_before, &doc) {
                    emitting = true;
                } else {
                    if holds(&self.resume_after, &doc) {
                        emitting = true;
                    }
                    continue;
                }
            }
            if holds(&self.stop_before, &doc) {
                break;
            }
            let last = holds(&self.stop_after, &doc);
            out.push(item);
            if last {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(bracket: &Bracket) -> Vec<&'static str> {
        let items = vec!["a", "b", "c", "d", "e"];
        bracket.apply(items, |n| json!({ "name": n }))
    }

    fn at(name: &str) -> String {
        format!("$[?@.name == '{name}']")
    }

    #[test]
    fn unbracketed_keeps_everything() {
        assert_eq!(names(&Bracket::default()), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn stop_and_resume() {
        let b = Bracket::parse(Some(&at("d")), None, Some(&at("b")), None).unwrap();
        assert_eq!(names(&b), vec!["b", "c"]);

        let b = Bracket::parse(None, Some(&at("d")), None, Some(&at("b"))).unwrap();
        assert_eq!(names(&b), vec!["c", "d"]);

        let b = Bracket::parse(None, Some(&at("a")), None, None).unwrap();
        assert_eq!(names(&b), vec!["a"]);
    }

    #[test]
    fn resume_never_met_is_empty() {
        let b = Bracket::parse(None, None, Some(&at("z")), None).unwrap();
        assert!(names(&b).is_empty());
    }
}
