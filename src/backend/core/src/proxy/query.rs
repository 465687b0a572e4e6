//! Query-language dialects and resource filter injection.
//!
//! Each backend speaks one query language. The dialect table records which
//! request parameters carry an expression or a series selector in that
//! language, the backend's own filter parameter, where the native API lives,
//! and which header selects its tenant. Every listed parameter is restricted
//! to the resource in the request path before forwarding, and the backend
//! filter parameter is always set, so a query can only see data labelled
//! with that resource.
//!
//! Expressions are checked before they are wrapped: brackets must balance
//! and string literals must close, otherwise a client could close the
//! wrapping parenthesis and escape the filter.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GateError, Result};

/// Static per-dialect routing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectSpec {
    /// Parameters whose value is a query expression.
    pub query_params: &'static [&'static str],
    /// Parameters whose value is a single series selector.
    pub selector_params: &'static [&'static str],
    /// Backend-enforced filter parameter, set on every forwarded request.
    pub extra_filter_param: &'static str,
    /// Default native endpoint prefix on the backend.
    pub native_prefix: &'static str,
    /// Default tenant header.
    pub tenant_header: &'static str,
}

const LOGS: DialectSpec = DialectSpec {
    query_params: &["query"],
    selector_params: &[],
    extra_filter_param: "extra_filters",
    native_prefix: "/select/logsql",
    tenant_header: "AccountID",
};

const METRICS: DialectSpec = DialectSpec {
    query_params: &["query"],
    selector_params: &["match[]"],
    extra_filter_param: "extra_label",
    native_prefix: "/api/v1",
    tenant_header: "X-Scope-OrgID",
};

/// Label operators accepted in a series selector, longest first.
const MATCH_OPERATORS: &[&str] = &["=~", "!~", "!=", "="];

/// Query language spoken by a proxied backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryDialect {
    /// LogsQL
    Logs,
    /// PromQL / MetricsQL
    Metrics,
}

impl QueryDialect {
    pub fn spec(&self) -> &'static DialectSpec {
        match self {
            Self::Logs => &LOGS,
            Self::Metrics => &METRICS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Metrics => "metrics",
        }
    }

    /// Whether `name` carries a query expression in this dialect.
    pub fn is_query_param(&self, name: &str) -> bool {
        self.spec().query_params.contains(&name)
    }

    /// Whether `name` carries a series selector in this dialect.
    pub fn is_selector_param(&self, name: &str) -> bool {
        self.spec().selector_params.contains(&name)
    }

    /// Restrict `expression` to series or entries labelled `resource_id`.
    ///
    /// Fails with `InvalidFormat` when the expression has unbalanced
    /// brackets or an unterminated string. `resource_id` must already have
    /// passed scope id validation; it is embedded without escaping.
    pub fn inject_filter(&self, expression: &str, resource_id: &str) -> Result<String> {
        let expression = expression.trim();
        let has_comment = self.check_expression(expression)?;

        Ok(match self {
            Self::Logs if expression.is_empty() => format!("resource_id:\"{}\"", resource_id),
            Self::Logs => format!("resource_id:\"{}\" AND ({})", resource_id, expression),
            Self::Metrics if expression.is_empty() => {
                format!("{{resource_id=\"{}\"}}", resource_id)
            }
            Self::Metrics => format!(
                "({}{}) and on(resource_id) {{resource_id=\"{}\"}}",
                expression,
                if has_comment { "\n" } else { "" },
                resource_id
            ),
        })
    }

    /// Add `resource_id="R"` to the matcher set of a series selector such as
    /// `up`, `{job="api"}` or `http_requests_total{code=~"5.."}`.
    pub fn restrict_selector(&self, selector: &str, resource_id: &str) -> Result<String> {
        let selector = selector.trim();
        let (name, matchers) = match selector.find('{') {
            Some(i) => (selector[..i].trim_end(), Some(&selector[i..])),
            None => (selector, None),
        };
        if !name.is_empty() && !is_metric_name(name) {
            return Err(GateError::invalid_format(format!(
                "Invalid metric name in series selector: {}",
                name
            )));
        }

        let mut restricted = match matchers {
            Some(block) => {
                let inner = block
                    .strip_prefix('{')
                    .and_then(|b| b.strip_suffix('}'))
                    .ok_or_else(|| {
                        GateError::invalid_format("Series selector must end with '}'")
                    })?;
                self.parse_matchers(inner)?
            }
            None => Vec::new(),
        };
        restricted.push(format!("resource_id=\"{}\"", resource_id));

        Ok(format!("{}{{{}}}", name, restricted.join(",")))
    }

    /// Value of the backend filter parameter for `resource_id`.
    pub fn extra_filter(&self, resource_id: &str) -> String {
        match self {
            Self::Logs => format!("{{\"resource_id\":\"{}\"}}", resource_id),
            Self::Metrics => format!("resource_id={}", resource_id),
        }
    }

    /// Restrict every expression and selector parameter in `pairs` and set
    /// the backend filter parameter. Client-supplied copies of the filter
    /// parameter are dropped.
    pub fn rewrite_params(
        &self,
        pairs: impl IntoIterator<Item = (String, String)>,
        resource_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let extra = self.spec().extra_filter_param;

        let mut rewritten = pairs
            .into_iter()
            .filter(|(name, _)| name != extra)
            .map(|(name, value)| {
                let value = if self.is_query_param(&name) {
                    self.inject_filter(&value, resource_id)?
                } else if self.is_selector_param(&name) {
                    self.restrict_selector(&value, resource_id)?
                } else {
                    value
                };
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        rewritten.push((extra.to_string(), self.extra_filter(resource_id)));
        Ok(rewritten)
    }

    /// Reject expressions whose brackets or string literals do not balance.
    /// Returns whether the expression ends in or contains a line comment.
    fn check_expression(&self, expression: &str) -> Result<bool> {
        let mut open: Vec<char> = Vec::new();
        let mut has_comment = false;
        let mut rest = expression;

        while let Some(c) = rest.chars().next() {
            match c {
                '"' | '\'' | '`' => {
                    let (_, after) = self.split_quoted(rest)?;
                    rest = after;
                    continue;
                }
                '#' if *self == Self::Metrics => {
                    has_comment = true;
                    let line_end = rest.find('\n').unwrap_or(rest.len());
                    rest = &rest[line_end..];
                    continue;
                }
                '#' => {
                    return Err(GateError::invalid_format(
                        "'#' is only allowed inside quoted strings in LogsQL expressions",
                    ))
                }
                '(' | '[' | '{' => open.push(c),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if open.pop() != Some(expected) {
                        return Err(GateError::invalid_format(format!(
                            "Unbalanced '{}' in query expression",
                            c
                        )));
                    }
                }
                _ => {}
            }
            rest = &rest[c.len_utf8()..];
        }

        match open.last() {
            Some(c) => Err(GateError::invalid_format(format!(
                "Unclosed '{}' in query expression",
                c
            ))),
            None => Ok(has_comment),
        }
    }

    /// Split a leading string literal off `input`, returning the literal
    /// (quotes included) and the remainder.
    fn split_quoted<'a>(&self, input: &'a str) -> Result<(&'a str, &'a str)> {
        let quote = match input.chars().next() {
            Some(q @ ('"' | '\'' | '`')) => q,
            _ => return Err(GateError::invalid_format("Expected a quoted string")),
        };
        let escapes = quote == '"' || (quote == '\'' && *self == Self::Metrics);

        let mut chars = input.char_indices().skip(1);
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                if !escapes {
                    return Err(GateError::invalid_format(
                        "Backslash escapes are not supported in this kind of string",
                    ));
                }
                chars.next();
            } else if c == quote {
                return Ok((&input[..=i], &input[i + 1..]));
            }
        }

        Err(GateError::invalid_format(
            "Unterminated string in query expression",
        ))
    }

    /// Parse `label op "value", ...`, returning each matcher normalized.
    fn parse_matchers(&self, inner: &str) -> Result<Vec<String>> {
        let mut matchers = Vec::new();
        let mut rest = inner.trim_start();

        while !rest.is_empty() {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            let label = &rest[..end];
            if label.is_empty() || label.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(GateError::invalid_format(
                    "Series selector matchers must start with a label name",
                ));
            }
            rest = rest[end..].trim_start();

            let op = MATCH_OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| {
                    GateError::invalid_format(format!(
                        "Missing match operator after label '{}'",
                        label
                    ))
                })?;
            rest = rest[op.len()..].trim_start();

            let (value, after) = self.split_quoted(rest)?;
            matchers.push(format!("{}{}{}", label, op, value));
            rest = after.trim_start();

            match rest.strip_prefix(',') {
                Some(after_comma) => rest = after_comma.trim_start(),
                None if rest.is_empty() => {}
                None => {
                    return Err(GateError::invalid_format(
                        "Series selector matchers must be separated by ','",
                    ))
                }
            }
        }

        Ok(matchers)
    }
}

impl fmt::Display for QueryDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Decode an `application/x-www-form-urlencoded` string into pairs.
pub fn parse_pairs(encoded: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(encoded.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Encode pairs as `application/x-www-form-urlencoded`.
pub fn encode_pairs(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_logs_filter() {
        assert_eq!(
            QueryDialect::Logs.inject_filter("level:error", "r1").unwrap(),
            r#"resource_id:"r1" AND (level:error)"#
        );
        assert_eq!(
            QueryDialect::Logs.inject_filter("  ", "r1").unwrap(),
            r#"resource_id:"r1""#
        );
    }

    #[test]
    fn test_metrics_filter() {
        assert_eq!(
            QueryDialect::Metrics
                .inject_filter("rate(http_requests_total[5m])", "r1")
                .unwrap(),
            r#"(rate(http_requests_total[5m])) and on(resource_id) {resource_id="r1"}"#
        );
    }

    #[test]
    fn test_filter_wraps_disjunctions() {
        let rewritten = QueryDialect::Logs.inject_filter("a OR b", "r1").unwrap();
        assert_eq!(rewritten, r#"resource_id:"r1" AND (a OR b)"#);
    }

    #[test]
    fn test_closing_paren_cannot_escape_filter() {
        for (dialect, expression) in [
            (QueryDialect::Logs, "x) OR (*"),
            (QueryDialect::Metrics, "up) or (vector(1)"),
            (QueryDialect::Metrics, "up) or vector(1"),
            (QueryDialect::Logs, "x) OR _msg:\"(\""),
            (QueryDialect::Metrics, "sum(up]"),
            (QueryDialect::Logs, "(a"),
        ] {
            let err = dialect.inject_filter(expression, "r1").unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidFormat, "{}", expression);
        }
    }

    #[test]
    fn test_brackets_inside_strings_are_ignored() {
        let rewritten = QueryDialect::Logs
            .inject_filter(r#"_msg:"unclosed (" OR _msg:"a\"b)""#, "r1")
            .unwrap();
        assert!(rewritten.starts_with(r#"resource_id:"r1" AND ("#));

        assert!(QueryDialect::Metrics
            .inject_filter(r#"up{path=~"/a(b"}"#, "r1")
            .is_ok());
    }

    #[test]
    fn test_unterminated_string_rejected() {
        assert!(QueryDialect::Logs.inject_filter(r#"_msg:"a) OR (*"#, "r1").is_err());
        assert!(QueryDialect::Metrics.inject_filter("up{a='x}", "r1").is_err());
    }

    #[test]
    fn test_comment_cannot_hide_brackets() {
        assert!(QueryDialect::Metrics
            .inject_filter("up # (\n) or vector(1)", "r1")
            .is_err());
        assert!(QueryDialect::Logs.inject_filter("x # ) OR (*", "r1").is_err());

        let rewritten = QueryDialect::Metrics
            .inject_filter("up # trailing", "r1")
            .unwrap();
        assert_eq!(
            rewritten,
            "(up # trailing\n) and on(resource_id) {resource_id=\"r1\"}"
        );
    }

    #[test]
    fn test_selector_restriction() {
        let m = QueryDialect::Metrics;
        assert_eq!(m.restrict_selector("up", "r1").unwrap(), r#"up{resource_id="r1"}"#);
        assert_eq!(
            m.restrict_selector(r#"http_requests_total{code=~"5..", job = 'api'}"#, "r1")
                .unwrap(),
            r#"http_requests_total{code=~"5..",job='api',resource_id="r1"}"#
        );
        assert_eq!(
            m.restrict_selector(r#"{__name__="up",}"#, "r1").unwrap(),
            r#"{__name__="up",resource_id="r1"}"#
        );
        assert_eq!(m.restrict_selector("{}", "r1").unwrap(), r#"{resource_id="r1"}"#);
    }

    #[test]
    fn test_malformed_selectors_rejected() {
        let m = QueryDialect::Metrics;
        for selector in [
            r#"{job="a" or job="b"}"#,
            r#"up{job="a"} or vector(1)"#,
            "sum(up)",
            r#"up{job="a""#,
            r#"up{job}"#,
        ] {
            assert!(m.restrict_selector(selector, "r1").is_err(), "{}", selector);
        }
    }

    #[test]
    fn test_rewrite_params() {
        let pairs = vec![
            ("query".to_string(), "up".to_string()),
            ("match[]".to_string(), "up".to_string()),
            ("extra_label".to_string(), "resource_id=other".to_string()),
            ("start".to_string(), "1700000000".to_string()),
        ];

        let rewritten = QueryDialect::Metrics.rewrite_params(pairs.clone(), "r9").unwrap();
        assert_eq!(
            rewritten,
            vec![
                (
                    "query".to_string(),
                    r#"(up) and on(resource_id) {resource_id="r9"}"#.to_string()
                ),
                ("match[]".to_string(), r#"up{resource_id="r9"}"#.to_string()),
                ("start".to_string(), "1700000000".to_string()),
                ("extra_label".to_string(), "resource_id=r9".to_string()),
            ]
        );

        let rewritten = QueryDialect::Logs.rewrite_params(pairs, "r9").unwrap();
        assert_eq!(rewritten[1].1, "up");
        assert_eq!(
            rewritten.last().unwrap(),
            &(
                "extra_filters".to_string(),
                r#"{"resource_id":"r9"}"#.to_string()
            )
        );
    }

    #[test]
    fn test_rewrite_params_rejects_bad_expression() {
        let pairs = vec![("query".to_string(), "x) OR (*".to_string())];
        assert!(QueryDialect::Logs.rewrite_params(pairs, "r1").is_err());
    }

    #[test]
    fn test_pairs_encoding() {
        let pairs = parse_pairs("query=a%20b&limit=10");
        assert_eq!(pairs[0], ("query".to_string(), "a b".to_string()));

        let encoded = encode_pairs(&pairs);
        assert_eq!(parse_pairs(&encoded), pairs);
    }

    #[test]
    fn test_dialect_defaults() {
        assert_eq!(QueryDialect::Logs.spec().tenant_header, "AccountID");
        assert_eq!(QueryDialect::Metrics.spec().native_prefix, "/api/v1");
        assert_eq!(QueryDialect::Metrics.spec().extra_filter_param, "extra_label");
    }
}
