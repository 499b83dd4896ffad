//! Stage prompt templates with `{name}` placeholders.
//!
//! `{{` and `}}` render as literal braces so templates can embed JSON examples.

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed, immutable prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Result of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Placeholders nothing could resolve; left verbatim in `text`.
    pub unresolved: Vec<String>,
}

impl StageTemplate {
    /// Parse a template, rejecting unbalanced braces and empty or invalid names.
    pub fn parse(goal: &str, stage: &str, source: &str) -> Result<Self, ConfigurationError> {
        let invalid = |message: String| {
            ConfigurationError::invalid(goal, format!("{}_prompt: {}", stage, message))
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(invalid(format!("unclosed placeholder '{{{}'", name)));
                    }
                    if name.is_empty() {
                        return Err(invalid("empty placeholder '{}'".to_string()));
                    }
                    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                        return Err(invalid(format!("invalid placeholder name '{}'", name)));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched '}'".to_string())),
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// The template text as written in the goal file.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance (duplicates kept).
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render against a resolver. Unresolved placeholders stay as `{name}`.
    pub fn render<F>(&self, mut resolve: F) -> Rendered
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut text = String::with_capacity(self.source.len());
        let mut unresolved = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Placeholder(name) => match resolve(name) {
                    Some(value) => text.push_str(&value),
                    None => {
                        text.push('{');
                        text.push_str(name);
                        text.push('}');
                        if !unresolved.contains(name) {
                            unresolved.push(name.clone());
                        }
                    }
                },
            }
        }

        Rendered { text, unresolved }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_resolves_and_keeps_unknown() {
        let template =
            StageTemplate::parse("g", "trend", "Goal {goal} over {days} days, {missing}.").unwrap();
        let rendered = template.render(|name| match name {
            "goal" => Some("grow".to_string()),
            "days" => Some("30".to_string()),
            _ => None,
        });
        assert_eq!(rendered.text, "Goal grow over 30 days, {missing}.");
        assert_eq!(rendered.unresolved, vec!["missing"]);
    }

    #[test]
    fn test_escaped_braces_are_literal() {
        let template = StageTemplate::parse("g", "trend", r#"Reply as {{"headline": "{goal}"}}"#)
            .unwrap();
        assert_eq!(template.placeholders().collect::<Vec<_>>(), vec!["goal"]);
        let rendered = template.render(|_| Some("x".to_string()));
        assert_eq!(rendered.text, r#"Reply as {"headline": "x"}"#);
    }

    #[test]
    fn test_malformed_templates_rejected() {
        for bad in ["open {goal", "empty {}", "stray } brace", "bad {na-me}"] {
            let err = StageTemplate::parse("g", "trend", bad).unwrap_err();
            assert!(err.to_string().contains("trend_prompt"), "{}", err);
        }
    }
}
