//! The `${...}` expression grammar that binds step inputs to prior outputs.
//!
//! Deliberately narrow: no user-defined functions, no arithmetic, no
//! conditionals. A template is literal text interleaved with `${ref}`
//! segments; `ref := segment ('.' segment | '[' index ']')*` where
//! `segment := [a-zA-Z_][a-zA-Z0-9_]*` and `index := integer | "text"`.
//! Conditionality lives in the `conditional` action kind, not here.

use std::collections::BTreeMap;

use crate::value::{PathSegment, Value};

/// The four root namespaces a reference may resolve against, in precedence
/// order: `steps`, `inputs`, `vars`, `context`.
#[derive(Debug, Default, Clone)]
pub struct Scope {
    pub steps: BTreeMap<String, Value>,
    pub inputs: BTreeMap<String, Value>,
    pub vars: BTreeMap<String, Value>,
    pub context: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup_root(&self, root: &str, name: &str) -> Option<&Value> {
        match root {
            "steps" => self.steps.get(name),
            "inputs" => self.inputs.get(name),
            "vars" => self.vars.get(name),
            "context" => self.context.get(name),
            _ => None,
        }
    }
}

/// Resolution/classification errors from `evaluate`.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("unbound reference: {0}")]
    Unbound(String),

    #[error("list index out of range: {0}")]
    OutOfRange(String),

    #[error("type mismatch accessing {0}")]
    TypeMismatch(String),

    #[error("malformed expression: {0}")]
    Syntax(String),
}

impl ExprError {
    /// Short error code per §7's taxonomy (`expr_unbound`, `expr_out_of_range`, `expr_type`).
    pub fn code(&self) -> &'static str {
        match self {
            ExprError::Unbound(_) => "expr_unbound",
            ExprError::OutOfRange(_) => "expr_out_of_range",
            ExprError::TypeMismatch(_) => "expr_type",
            ExprError::Syntax(_) => "expr_syntax",
        }
    }
}

/// A parsed reference: root namespace plus the dotted/indexed path that
/// follows it (e.g. `steps.a.output.items[0]` -> root="steps",
/// path=["a","output","items", Index(0)]).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    root: String,
    path: Vec<PathSegment>,
}

/// Evaluate a template string against a scope.
///
/// If the entire template is a single `${ref}` the resolved value's type is
/// preserved (e.g. a step output map stays a map). Otherwise every `${ref}`
/// segment is coerced to text and concatenated with the surrounding literal
/// text.
pub fn evaluate(template: &str, scope: &Scope) -> Result<Value, ExprError> {
    let segments = parse_template(template)?;

    if let [TemplateSegment::Ref(reference)] = segments.as_slice() {
        return resolve(reference, scope).cloned();
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            TemplateSegment::Literal(text) => out.push_str(text),
            TemplateSegment::Ref(reference) => {
                out.push_str(&resolve(reference, scope)?.coerce_text());
            }
        }
    }
    Ok(Value::Text(out))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Ref(Reference),
}

fn parse_template(template: &str) -> Result<Vec<TemplateSegment>, ExprError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if !literal.is_empty() {
                segments.push(TemplateSegment::Literal(std::mem::take(&mut literal)));
            }
            let close = template[i..]
                .find('}')
                .map(|p| i + p)
                .ok_or_else(|| ExprError::Syntax("unterminated ${...}".to_string()))?;
            let inner = &template[i + 2..close];
            segments.push(TemplateSegment::Ref(parse_reference(inner)?));
            i = close + 1;
        } else {
            let ch = template[i..].chars().next().unwrap();
            literal.push(ch);
            i += ch.len_utf8();
        }
    }

    if !literal.is_empty() {
        segments.push(TemplateSegment::Literal(literal));
    }
    Ok(segments)
}

fn parse_reference(inner: &str) -> Result<Reference, ExprError> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Err(ExprError::Syntax("empty reference".to_string()));
    }

    let mut path = Vec::new();
    let mut chars = inner.char_indices().peekable();
    let mut current = String::new();
    let mut root: Option<String> = None;

    let push_segment = |root: &mut Option<String>, path: &mut Vec<PathSegment>, seg: String| {
        if seg.is_empty() {
            return;
        }
        if root.is_none() {
            *root = Some(seg);
        } else {
            path.push(PathSegment::Key(seg));
        }
    };

    while let Some((i, ch)) = chars.next() {
        match ch {
            '.' => {
                push_segment(&mut root, &mut path, std::mem::take(&mut current));
            }
            '[' => {
                push_segment(&mut root, &mut path, std::mem::take(&mut current));
                let close = inner[i..]
                    .find(']')
                    .map(|p| i + p)
                    .ok_or_else(|| ExprError::Syntax("unterminated [...]".to_string()))?;
                let index_text = inner[i + 1..close].trim();
                path.push(parse_index(index_text)?);
                // advance the outer iterator past the consumed `]`
                while let Some(&(j, _)) = chars.peek() {
                    if j < close + 1 {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            _ => current.push(ch),
        }
    }
    push_segment(&mut root, &mut path, current);

    let root = root.ok_or_else(|| ExprError::Syntax("missing root namespace".to_string()))?;
    if !matches!(root.as_str(), "steps" | "inputs" | "vars" | "context") {
        return Err(ExprError::Syntax(format!("unknown namespace: {root}")));
    }
    Ok(Reference { root, path })
}

fn parse_index(text: &str) -> Result<PathSegment, ExprError> {
    if let Some(stripped) = text.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(PathSegment::Key(stripped.to_string()));
    }
    text.parse::<i64>()
        .map(PathSegment::Index)
        .map_err(|_| ExprError::Syntax(format!("invalid index: {text}")))
}

fn resolve<'a>(reference: &Reference, scope: &'a Scope) -> Result<&'a Value, ExprError> {
    let display = reference_display(reference);

    let first_key = match reference.path.first() {
        Some(PathSegment::Key(k)) => k.clone(),
        _ => {
            return Err(ExprError::Syntax(format!(
                "{} is missing a leaf name after the namespace",
                display
            )))
        }
    };

    let mut current = scope
        .lookup_root(&reference.root, &first_key)
        .ok_or_else(|| ExprError::Unbound(display.clone()))?;

    for segment in &reference.path[1..] {
        current = match (current, segment) {
            (Value::List(items), PathSegment::Index(idx)) => {
                let idx = usize::try_from(*idx)
                    .ok()
                    .filter(|i| *i < items.len())
                    .ok_or_else(|| ExprError::OutOfRange(display.clone()))?;
                &items[idx]
            }
            (Value::Map(_), _) => current
                .get_index(segment)
                .ok_or_else(|| ExprError::Unbound(display.clone()))?,
            _ => return Err(ExprError::TypeMismatch(display.clone())),
        };
    }

    Ok(current)
}

/// Extract the step ids referenced via `${steps.<id>...}` in a template,
/// without requiring a `Scope` to resolve against. Used by the DAG planner
/// to validate invariant (iii): every `steps.X` reference must point at a
/// step that is transitively upstream of the one declaring it.
pub fn referenced_step_ids(template: &str) -> Result<Vec<String>, ExprError> {
    let segments = parse_template(template)?;
    Ok(segments
        .into_iter()
        .filter_map(|segment| match segment {
            TemplateSegment::Ref(reference) if reference.root == "steps" => {
                match reference.path.first() {
                    Some(PathSegment::Key(id)) => Some(id.clone()),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect())
}

fn reference_display(reference: &Reference) -> String {
    let mut out = reference.root.clone();
    for segment in &reference.path {
        match segment {
            PathSegment::Key(k) => {
                out.push('.');
                out.push_str(k);
            }
            PathSegment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}
