//! Rule representation and the declarative rule parser.
//!
//! A rule is a boolean-logic tree over typed features, plus metadata naming
//! it, placing it in a '/'-delimited namespace, and pinning it to exactly one
//! evaluation scope. Rules are authored as YAML documents:
//!
//! ```yaml
//! rule:
//!   meta:
//!     name: resolve DNS
//!     namespace: communication/dns
//!     scope: thread
//!     authors: [analyst@example.com]
//!   features:
//!     - or:
//!         - api: GetAddrInfoW
//!         - match: communication/dns/raw
//! ```
//!
//! Every `match:` reference is enumerated at parse time so the dependency
//! resolver never has to re-walk the tree.

use serde_yaml::Value;

use crate::error::{DiscernError, Result};
use crate::features::{regex_token_parts, Feature};
use crate::scopes::Scope;

/// One node of a rule's boolean logic tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    /// True iff at least `count` children are true.
    Some { count: usize, children: Vec<Node> },
    /// Never fails the parent, but the child's real verdict is recorded.
    Optional(Box<Node>),
    /// True iff the number of occurrences of `feature` is within bounds.
    Count { feature: Feature, min: usize, max: Option<usize> },
    Feature(Feature),
    /// Reference to another rule by name or namespace.
    Match(String),
}

impl Node {
    /// Human-readable label for result trees.
    pub fn label(&self) -> String {
        match self {
            Node::And(_) => "and".to_string(),
            Node::Or(_) => "or".to_string(),
            Node::Not(_) => "not".to_string(),
            Node::Some { count, .. } => format!("{count} or more"),
            Node::Optional(_) => "optional".to_string(),
            Node::Count { feature, min, max } => match max {
                Some(max) if max == min => format!("count({}): {min}", feature.compact()),
                Some(max) => format!("count({}): ({min}, {max})", feature.compact()),
                None => format!("count({}): {min} or more", feature.compact()),
            },
            Node::Feature(feature) => feature.to_string(),
            Node::Match(reference) => format!("match: {reference}"),
        }
    }

    /// Every `match:` reference below this node, in document order.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Node::Match(reference) => out.push(reference),
            Node::Feature(_) | Node::Count { .. } => {}
            Node::Not(child) | Node::Optional(child) => child.collect_references(out),
            Node::And(children) | Node::Or(children) | Node::Some { children, .. } => {
                for child in children {
                    child.collect_references(out);
                }
            }
        }
    }

    /// Every feature predicate below this node, including count subjects.
    pub fn collect_features<'a>(&'a self, out: &mut Vec<&'a Feature>) {
        match self {
            Node::Feature(feature) | Node::Count { feature, .. } => out.push(feature),
            Node::Match(_) => {}
            Node::Not(child) | Node::Optional(child) => child.collect_features(out),
            Node::And(children) | Node::Or(children) | Node::Some { children, .. } => {
                for child in children {
                    child.collect_features(out);
                }
            }
        }
    }
}

/// Free-form rule metadata carried into reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleMeta {
    pub authors: Vec<String>,
    pub references: Vec<String>,
    pub description: Option<String>,
}

/// A parsed, validated rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub namespace: String,
    pub scope: Scope,
    pub meta: RuleMeta,
    pub logic: Node,
    /// Original rule text, kept verbatim for reporting.
    pub source: String,
    /// File path (or equivalent) the rule was parsed from, for diagnostics.
    pub source_name: String,
    references: Vec<String>,
}

impl Rule {
    /// Rule names and namespaces this rule's logic references.
    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// The namespace itself and every ancestor prefix, shortest first.
    /// `a/b/c` yields `a`, `a/b`, `a/b/c`.
    pub fn namespace_prefixes(&self) -> Vec<&str> {
        let mut prefixes = Vec::new();
        let mut end = 0;
        for part in self.namespace.split('/') {
            end += part.len();
            prefixes.push(&self.namespace[..end]);
            end += 1; // the '/'
        }
        prefixes
    }
}

/// Parse one rule document, failing with a syntax error naming the offending
/// construct. `source_name` is the file path (or equivalent) for diagnostics.
pub fn parse_rule(source_name: &str, text: &str) -> Result<Rule> {
    let syntax = |message: String| DiscernError::rule_syntax(source_name, message);

    let doc: Value = serde_yaml::from_str(text)
        .map_err(|e| syntax(format!("invalid YAML: {e}")))?;
    let rule = doc
        .get("rule")
        .filter(|v| v.is_mapping())
        .ok_or_else(|| syntax("missing top-level 'rule' block".to_string()))?;
    let meta = rule
        .get("meta")
        .filter(|v| v.is_mapping())
        .ok_or_else(|| syntax("missing 'meta' block".to_string()))?;

    let required = |key: &str| -> Result<String> {
        meta.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| syntax(format!("meta is missing required field '{key}'")))
    };

    let name = required("name")?;
    let namespace = required("namespace")?;
    let scope: Scope = required("scope")?
        .parse()
        .map_err(|e: String| syntax(e))?;

    let string_list = |key: &str| -> Vec<String> {
        meta.get(key)
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let rule_meta = RuleMeta {
        authors: string_list("authors"),
        references: string_list("references"),
        description: meta.get("description").and_then(Value::as_str).map(str::to_string),
    };

    let features = rule
        .get("features")
        .and_then(Value::as_sequence)
        .ok_or_else(|| syntax("missing 'features' block".to_string()))?;
    if features.is_empty() {
        return Err(syntax("'features' block is empty".to_string()));
    }

    let mut children = features
        .iter()
        .map(|value| parse_node(source_name, value))
        .collect::<Result<Vec<_>>>()?;
    let logic = if children.len() == 1 {
        children.remove(0)
    } else {
        Node::And(children)
    };

    let mut references = Vec::new();
    logic.collect_references(&mut references);
    let references = references.into_iter().map(str::to_string).collect();

    let parsed = Rule {
        name,
        namespace,
        scope,
        meta: rule_meta,
        logic,
        source: text.to_string(),
        source_name: source_name.to_string(),
        references,
    };
    validate_feature_scopes(&parsed)?;
    Ok(parsed)
}

/// Reject rules whose logic predicates on a feature kind the declared scope
/// cannot see: a rule's scope must be >= the scope of everything it queries.
fn validate_feature_scopes(rule: &Rule) -> Result<()> {
    let mut features = Vec::new();
    rule.logic.collect_features(&mut features);
    for feature in features {
        if !rule.scope.supports(feature.kind()) {
            return Err(DiscernError::scope_mismatch(
                &rule.name,
                feature.to_string(),
                rule.scope.to_string(),
            ));
        }
    }
    Ok(())
}

fn parse_node(source_name: &str, value: &Value) -> Result<Node> {
    let syntax = |message: String| DiscernError::rule_syntax(source_name, message);

    let mapping = value
        .as_mapping()
        .ok_or_else(|| syntax(format!("expected a mapping node, got: {value:?}")))?;
    if mapping.len() != 1 {
        return Err(syntax("logic nodes must have exactly one key".to_string()));
    }
    let (key, body) = mapping.iter().next().unwrap();
    let key = key
        .as_str()
        .ok_or_else(|| syntax("logic node keys must be strings".to_string()))?;

    match key {
        "and" | "or" => {
            let children = parse_children(source_name, key, body)?;
            Ok(if key == "and" { Node::And(children) } else { Node::Or(children) })
        }
        "not" | "optional" => {
            let mut children = parse_children(source_name, key, body)?;
            if children.len() != 1 {
                return Err(syntax(format!("'{key}' takes exactly one child")));
            }
            let child = Box::new(children.remove(0));
            Ok(if key == "not" { Node::Not(child) } else { Node::Optional(child) })
        }
        "match" => {
            let reference = body
                .as_str()
                .ok_or_else(|| syntax("'match' takes a rule name or namespace".to_string()))?;
            Ok(Node::Match(reference.to_string()))
        }
        _ => {
            if let Some(count) = parse_n_or_more(key) {
                let children = parse_children(source_name, key, body)?;
                if count == 0 || count > children.len() {
                    return Err(syntax(format!(
                        "'{count} or more' needs between 1 and {} (the arity)",
                        children.len()
                    )));
                }
                return Ok(Node::Some { count, children });
            }
            if let Some(inner) = key.strip_prefix("count(").and_then(|k| k.strip_suffix(')')) {
                let feature = parse_count_subject(source_name, inner)?;
                let (min, max) = parse_count_bounds(source_name, body)?;
                return Ok(Node::Count { feature, min, max });
            }
            Ok(Node::Feature(parse_leaf(source_name, key, body)?))
        }
    }
}

fn parse_children(source_name: &str, key: &str, body: &Value) -> Result<Vec<Node>> {
    let seq = body.as_sequence().ok_or_else(|| {
        DiscernError::rule_syntax(source_name, format!("'{key}' takes a list of children"))
    })?;
    if seq.is_empty() {
        return Err(DiscernError::rule_syntax(
            source_name,
            format!("'{key}' has no children"),
        ));
    }
    seq.iter().map(|child| parse_node(source_name, child)).collect()
}

fn parse_n_or_more(key: &str) -> Option<usize> {
    key.strip_suffix(" or more")?.trim().parse().ok()
}

/// Subject of a `count(kind(value))` key.
fn parse_count_subject(source_name: &str, inner: &str) -> Result<Feature> {
    let open = inner.find('(').ok_or_else(|| {
        DiscernError::rule_syntax(source_name, format!("malformed count subject '{inner}'"))
    })?;
    let kind = &inner[..open];
    let value = inner[open + 1..].strip_suffix(')').ok_or_else(|| {
        DiscernError::rule_syntax(source_name, format!("malformed count subject '{inner}'"))
    })?;
    parse_leaf(source_name, kind, &Value::String(value.to_string()))
}

/// Bounds of a count node: `5`, `"5"`, `"5 or more"`, or `"(2, 10)"`.
fn parse_count_bounds(source_name: &str, body: &Value) -> Result<(usize, Option<usize>)> {
    let syntax = |message: String| DiscernError::rule_syntax(source_name, message);

    if let Some(n) = body.as_u64() {
        return Ok((n as usize, Some(n as usize)));
    }
    let text = body
        .as_str()
        .ok_or_else(|| syntax(format!("malformed count bound: {body:?}")))?
        .trim();
    if let Some(min) = parse_n_or_more(text) {
        return Ok((min, None));
    }
    if let Some(range) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        let (lo, hi) = range
            .split_once(',')
            .ok_or_else(|| syntax(format!("malformed count range '{text}'")))?;
        let min = lo.trim().parse().map_err(|_| syntax(format!("malformed count range '{text}'")))?;
        let max = hi.trim().parse().map_err(|_| syntax(format!("malformed count range '{text}'")))?;
        if max < min {
            return Err(syntax(format!("count range '{text}' is inverted")));
        }
        return Ok((min, Some(max)));
    }
    text.parse()
        .map(|n| (n, Some(n)))
        .map_err(|_| syntax(format!("malformed count bound '{text}'")))
}

fn parse_leaf(source_name: &str, kind: &str, body: &Value) -> Result<Feature> {
    let syntax = |message: String| DiscernError::rule_syntax(source_name, message);

    let string_value = || -> Result<String> {
        body.as_str()
            .map(str::to_string)
            .ok_or_else(|| syntax(format!("'{kind}' takes a string value, got: {body:?}")))
    };

    match kind {
        "import" => Ok(Feature::Import(string_value()?)),
        "export" => Ok(Feature::Export(string_value()?)),
        "section" => Ok(Feature::Section(string_value()?)),
        "function-name" => Ok(Feature::FunctionName(string_value()?)),
        "api" => Ok(Feature::Api(string_value()?)),
        "mnemonic" => Ok(Feature::Mnemonic(string_value()?)),
        "characteristic" => Ok(Feature::Characteristic(string_value()?)),
        "os" => Ok(Feature::Os(string_value()?)),
        "arch" => Ok(Feature::Arch(string_value()?)),
        "format" => Ok(Feature::Format(string_value()?)),
        "substring" => Ok(Feature::Substring(string_value()?)),
        "string" => {
            let value = string_value()?;
            if regex_token_parts(&value).is_some() {
                Ok(Feature::Regex(value))
            } else {
                Ok(Feature::String(value))
            }
        }
        "number" => {
            if let Some(n) = body.as_i64() {
                return Ok(Feature::Number(n as i128));
            }
            if let Some(n) = body.as_u64() {
                return Ok(Feature::Number(n as i128));
            }
            let text = string_value()?;
            let parsed = if let Some(hex) = text.strip_prefix("0x") {
                i128::from_str_radix(hex, 16)
            } else {
                text.parse()
            };
            parsed
                .map(Feature::Number)
                .map_err(|_| syntax(format!("malformed number '{text}'")))
        }
        other => Err(syntax(format!("unknown feature kind '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DNS_RULE: &str = r#"
rule:
  meta:
    name: resolve DNS
    namespace: communication/dns
    scope: thread
    authors: [analyst@example.com]
    references: [https://example.com/dns]
    description: resolves hostnames via winsock
  features:
    - or:
        - api: GetAddrInfoW
        - api: getaddrinfo
"#;

    #[test]
    fn test_parse_well_formed_rule() {
        let rule = parse_rule("dns.yml", DNS_RULE).unwrap();
        assert_eq!(rule.name, "resolve DNS");
        assert_eq!(rule.namespace, "communication/dns");
        assert_eq!(rule.scope, Scope::Thread);
        assert_eq!(rule.meta.authors, vec!["analyst@example.com"]);
        assert_eq!(rule.meta.description.as_deref(), Some("resolves hostnames via winsock"));
        assert!(rule.references().is_empty());
        match &rule.logic {
            Node::Or(children) => assert_eq!(children.len(), 2),
            other => panic!("expected or, got {other:?}"),
        }
    }

    #[test]
    fn test_references_enumerated_at_parse_time() {
        let text = r#"
rule:
  meta:
    name: beacons over DNS
    namespace: communication/c2
    scope: process
  features:
    - and:
        - match: communication/dns
        - not:
            - match: benign/resolver
"#;
        let rule = parse_rule("c2.yml", text).unwrap();
        assert_eq!(rule.references(), ["communication/dns", "benign/resolver"]);
    }

    #[test]
    fn test_counting_quantifier_bounds() {
        let template = |n: usize| {
            format!(
                r#"
rule:
  meta:
    name: quantified
    namespace: test
    scope: function
  features:
    - {n} or more:
        - mnemonic: xor
        - mnemonic: shl
        - mnemonic: ror
"#
            )
        };
        assert!(parse_rule("q.yml", &template(1)).is_ok());
        assert!(parse_rule("q.yml", &template(3)).is_ok());
        assert!(parse_rule("q.yml", &template(0)).is_err());
        assert!(parse_rule("q.yml", &template(4)).is_err());
    }

    #[test]
    fn test_not_takes_exactly_one_child() {
        let text = r#"
rule:
  meta:
    name: bad not
    namespace: test
    scope: file
  features:
    - not:
        - string: a
        - string: b
"#;
        let err = parse_rule("bad.yml", text).unwrap_err();
        assert!(err.to_string().contains("exactly one child"), "{err}");
    }

    #[test]
    fn test_unknown_feature_kind_rejected() {
        let text = r#"
rule:
  meta:
    name: bad kind
    namespace: test
    scope: file
  features:
    - frobnicate: yes please
"#;
        let err = parse_rule("bad.yml", text).unwrap_err();
        assert!(err.to_string().contains("unknown feature kind"), "{err}");
    }

    #[test]
    fn test_scope_feature_mismatch_rejected_at_load() {
        let text = r#"
rule:
  meta:
    name: import at instruction scope
    namespace: test
    scope: instruction
  features:
    - import: CreateRemoteThread
"#;
        let err = parse_rule("bad.yml", text).unwrap_err();
        assert!(matches!(err, DiscernError::ScopeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_missing_required_meta() {
        let text = r#"
rule:
  meta:
    name: nameless namespace
    scope: file
  features:
    - string: x
"#;
        let err = parse_rule("bad.yml", text).unwrap_err();
        assert!(err.to_string().contains("namespace"), "{err}");
    }

    #[test]
    fn test_regex_string_leaf() {
        let text = r#"
rule:
  meta:
    name: url
    namespace: test
    scope: file
  features:
    - string: "/^https?:/i"
"#;
        let rule = parse_rule("re.yml", text).unwrap();
        assert_eq!(rule.logic, Node::Feature(Feature::Regex("/^https?:/i".to_string())));
    }

    #[test]
    fn test_count_node_forms() {
        let text = r#"
rule:
  meta:
    name: busy resolver
    namespace: test
    scope: thread
  features:
    - and:
        - count(api(GetAddrInfoW)): 5
        - count(api(free)): 2 or more
        - count(number(4096)): (1, 8)
"#;
        let rule = parse_rule("count.yml", text).unwrap();
        let Node::And(children) = &rule.logic else { panic!() };
        assert_eq!(
            children[0],
            Node::Count {
                feature: Feature::Api("GetAddrInfoW".to_string()),
                min: 5,
                max: Some(5)
            }
        );
        assert_eq!(
            children[1],
            Node::Count { feature: Feature::Api("free".to_string()), min: 2, max: None }
        );
        assert_eq!(
            children[2],
            Node::Count { feature: Feature::Number(4096), min: 1, max: Some(8) }
        );
    }

    #[test]
    fn test_inverted_count_range_rejected() {
        let text = r#"
rule:
  meta:
    name: inverted
    namespace: test
    scope: thread
  features:
    - count(api(free)): (5, 2)
"#;
        assert!(parse_rule("count.yml", text).is_err());
    }

    #[test]
    fn test_namespace_prefixes() {
        let rule = parse_rule("dns.yml", DNS_RULE).unwrap();
        assert_eq!(rule.namespace_prefixes(), ["communication", "communication/dns"]);
    }

    #[test]
    fn test_hex_number_leaf() {
        let text = r#"
rule:
  meta:
    name: page size
    namespace: test
    scope: call
  features:
    - number: "0x1000"
"#;
        let rule = parse_rule("hex.yml", text).unwrap();
        assert_eq!(rule.logic, Node::Feature(Feature::Number(4096)));
    }
}
