//! Addressable parameter paths.
//!
//! A [`ParamPath`] names one numeric slot (or a slice of an array) inside a
//! model tree, e.g. `binding_model.sma_ka[1:]` or
//! `method.method_steps[2].flow_rate`. Model types opt into path navigation by
//! implementing [`Addressable`], which exposes their numeric fields, nested
//! nodes and lists by name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{KrError, KrResult};
use crate::config_error;

/// One step of a parameter path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    /// Half-open range; missing bounds mean "from the start" / "to the end".
    Slice {
        start: Option<usize>,
        end: Option<usize>,
    },
}

/// Read access to a named field of an [`Addressable`] node.
pub enum FieldRef<'a> {
    Scalar(f64),
    Array(&'a [f64]),
    Node(&'a dyn Addressable),
    List(Vec<&'a dyn Addressable>),
}

/// Write access to a named field of an [`Addressable`] node.
pub enum FieldMut<'a> {
    Scalar(&'a mut f64),
    Array(&'a mut [f64]),
    Node(&'a mut dyn Addressable),
    List(Vec<&'a mut dyn Addressable>),
}

/// A node of the model tree that can be navigated by field name.
pub trait Addressable {
    fn field(&self, name: &str) -> Option<FieldRef<'_>>;

    fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>>;

    /// Names accepted by [`Addressable::field`], used in error messages.
    fn field_names(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Parsed, validated parameter path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParamPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl ParamPath {
    pub fn parse(raw: &str) -> KrResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(config_error!("Empty parameter path"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !is_identifier(name) {
                return Err(config_error!("Invalid field name '{}' in path '{}'", name, raw));
            }
            segments.push(PathSegment::Field(name.to_string()));

            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .filter(|_| rest.starts_with('['))
                    .ok_or_else(|| config_error!("Unbalanced brackets in path '{}'", raw))?;
                segments.push(parse_bracket(&rest[1..close], raw)?);
                rest = &rest[close + 1..];
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Name of the last field in the path (`sma_ka` for `binding_model.sma_ka[1:]`).
    pub fn family(&self) -> &str {
        self.segments
            .iter()
            .rev()
            .find_map(|seg| match seg {
                PathSegment::Field(name) => Some(name.as_str()),
                _ => None,
            })
            .unwrap_or(&self.raw)
    }

    /// Same path with its trailing slice (or index) replaced by `[index]`.
    pub fn with_index(&self, index: usize) -> KrResult<Self> {
        let mut segments = self.segments.clone();
        match segments.last() {
            Some(PathSegment::Slice { .. }) | Some(PathSegment::Index(_)) => {
                segments.pop();
            }
            _ => {}
        }
        segments.push(PathSegment::Index(index));
        Ok(Self {
            raw: render(&segments),
            segments,
        })
    }

    /// True when the path can address more than one value.
    pub fn is_multi(&self) -> bool {
        matches!(self.segments.last(), Some(PathSegment::Slice { .. }))
    }

    /// All values addressed by this path.
    pub fn resolve(&self, root: &dyn Addressable) -> KrResult<Vec<f64>> {
        resolve_in(root, &self.segments, self)
    }

    /// Write `value` into every slot addressed by this path.
    pub fn assign(&self, root: &mut dyn Addressable, value: f64) -> KrResult<()> {
        assign_in(root, &self.segments, self, value)
    }

    /// Check the path addresses at least one numeric value of `root`.
    pub fn validate(&self, root: &dyn Addressable) -> KrResult<()> {
        self.resolve(root).map(|_| ())
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ParamPath {
    type Err = KrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ParamPath {
    type Error = KrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ParamPath> for String {
    fn from(path: ParamPath) -> Self {
        path.raw
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_bracket(inner: &str, raw: &str) -> KrResult<PathSegment> {
    let parse_bound = |s: &str| -> KrResult<Option<usize>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<usize>()
            .map(Some)
            .map_err(|_| config_error!("Invalid index '{}' in path '{}'", s, raw))
    };

    match inner.split_once(':') {
        Some((start, end)) => Ok(PathSegment::Slice {
            start: parse_bound(start)?,
            end: parse_bound(end)?,
        }),
        None => parse_bound(inner)?
            .map(PathSegment::Index)
            .ok_or_else(|| config_error!("Empty index in path '{}'", raw)),
    }
}

fn render(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            PathSegment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathSegment::Index(i) => out.push_str(&format!("[{i}]")),
            PathSegment::Slice { start, end } => {
                let fmt_bound = |b: &Option<usize>| b.map(|v| v.to_string()).unwrap_or_default();
                out.push_str(&format!("[{}:{}]", fmt_bound(start), fmt_bound(end)));
            }
        }
    }
    out
}

fn slice_range(
    len: usize,
    start: Option<usize>,
    end: Option<usize>,
    path: &ParamPath,
) -> KrResult<std::ops::Range<usize>> {
    let start = start.unwrap_or(0);
    let end = end.unwrap_or(len);
    if start >= end || end > len {
        return Err(config_error!(
            "Slice [{}:{}] selects nothing from {} value(s) in '{}'",
            start,
            end,
            len,
            path
        ));
    }
    Ok(start..end)
}

fn unknown_field(node: &dyn Addressable, name: &str, path: &ParamPath) -> KrError {
    config_error!(
        "Unknown field '{}' in path '{}' (expected one of: {})",
        name,
        path,
        node.field_names().join(", ")
    )
}

fn resolve_in(node: &dyn Addressable, segs: &[PathSegment], path: &ParamPath) -> KrResult<Vec<f64>> {
    let (name, rest) = match segs.split_first() {
        Some((PathSegment::Field(name), rest)) => (name, rest),
        _ => return Err(config_error!("Path '{}' does not address a numeric value", path)),
    };
    let field = node
        .field(name)
        .ok_or_else(|| unknown_field(node, name, path))?;

    match (field, rest) {
        (FieldRef::Scalar(v), []) => Ok(vec![v]),
        (FieldRef::Array(values), []) => Ok(values.to_vec()),
        (FieldRef::Array(values), [PathSegment::Index(i)]) => values
            .get(*i)
            .map(|v| vec![*v])
            .ok_or_else(|| config_error!("Index {} out of range in '{}'", i, path)),
        (FieldRef::Array(values), [PathSegment::Slice { start, end }]) => {
            let range = slice_range(values.len(), *start, *end, path)?;
            Ok(values[range].to_vec())
        }
        (FieldRef::Node(child), rest) if !rest.is_empty() => resolve_in(child, rest, path),
        (FieldRef::List(items), [PathSegment::Index(i), tail @ ..]) if !tail.is_empty() => {
            let item = items
                .get(*i)
                .ok_or_else(|| config_error!("Index {} out of range in '{}'", i, path))?;
            resolve_in(*item, tail, path)
        }
        _ => Err(config_error!("Path '{}' does not address a numeric value", path)),
    }
}

fn assign_in(
    node: &mut dyn Addressable,
    segs: &[PathSegment],
    path: &ParamPath,
    value: f64,
) -> KrResult<()> {
    let (name, rest) = match segs.split_first() {
        Some((PathSegment::Field(name), rest)) => (name, rest),
        _ => return Err(config_error!("Path '{}' does not address a numeric value", path)),
    };
    let names = node.field_names();
    let field = node.field_mut(name).ok_or_else(|| {
        config_error!(
            "Unknown field '{}' in path '{}' (expected one of: {})",
            name,
            path,
            names.join(", ")
        )
    })?;

    match (field, rest) {
        (FieldMut::Scalar(slot), []) => {
            *slot = value;
            Ok(())
        }
        (FieldMut::Array(values), []) => {
            values.iter_mut().for_each(|v| *v = value);
            Ok(())
        }
        (FieldMut::Array(values), [PathSegment::Index(i)]) => {
            let slot = values
                .get_mut(*i)
                .ok_or_else(|| config_error!("Index {} out of range in '{}'", i, path))?;
            *slot = value;
            Ok(())
        }
        (FieldMut::Array(values), [PathSegment::Slice { start, end }]) => {
            let range = slice_range(values.len(), *start, *end, path)?;
            values[range].iter_mut().for_each(|v| *v = value);
            Ok(())
        }
        (FieldMut::Node(child), rest) if !rest.is_empty() => assign_in(child, rest, path, value),
        (FieldMut::List(items), [PathSegment::Index(i), tail @ ..]) if !tail.is_empty() => {
            let item = items
                .into_iter()
                .nth(*i)
                .ok_or_else(|| config_error!("Index {} out of range in '{}'", i, path))?;
            assign_in(item, tail, path, value)
        }
        _ => Err(config_error!("Path '{}' does not address a numeric value", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf {
        rate: f64,
    }

    impl Addressable for Leaf {
        fn field(&self, name: &str) -> Option<FieldRef<'_>> {
            match name {
                "rate" => Some(FieldRef::Scalar(self.rate)),
                _ => None,
            }
        }

        fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
            match name {
                "rate" => Some(FieldMut::Scalar(&mut self.rate)),
                _ => None,
            }
        }
    }

    struct Root {
        coeffs: Vec<f64>,
        leaves: Vec<Leaf>,
    }

    impl Addressable for Root {
        fn field(&self, name: &str) -> Option<FieldRef<'_>> {
            match name {
                "coeffs" => Some(FieldRef::Array(&self.coeffs)),
                "leaves" => Some(FieldRef::List(
                    self.leaves.iter().map(|l| l as &dyn Addressable).collect(),
                )),
                _ => None,
            }
        }

        fn field_mut(&mut self, name: &str) -> Option<FieldMut<'_>> {
            match name {
                "coeffs" => Some(FieldMut::Array(&mut self.coeffs)),
                "leaves" => Some(FieldMut::List(
                    self.leaves
                        .iter_mut()
                        .map(|l| l as &mut dyn Addressable)
                        .collect(),
                )),
                _ => None,
            }
        }

        fn field_names(&self) -> &'static [&'static str] {
            &["coeffs", "leaves"]
        }
    }

    fn root() -> Root {
        Root {
            coeffs: vec![0.0, 1.0, 2.0, 3.0],
            leaves: vec![Leaf { rate: 10.0 }, Leaf { rate: 20.0 }],
        }
    }

    #[test]
    fn parses_slices_and_indices() {
        let path = ParamPath::parse("binding_model.sma_ka[1:]").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Field("binding_model".into()),
                PathSegment::Field("sma_ka".into()),
                PathSegment::Slice {
                    start: Some(1),
                    end: None
                },
            ]
        );
        assert_eq!(path.family(), "sma_ka");
        assert!(path.is_multi());

        let nested = ParamPath::parse("method.method_steps[2].flow_rate").unwrap();
        assert_eq!(nested.segments()[2], PathSegment::Index(2));
        assert_eq!(nested.family(), "flow_rate");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(ParamPath::parse("").is_err());
        assert!(ParamPath::parse("a..b").is_err());
        assert!(ParamPath::parse("a[1").is_err());
        assert!(ParamPath::parse("a[x]").is_err());
        assert!(ParamPath::parse("1abc").is_err());
    }

    #[test]
    fn with_index_replaces_trailing_slice() {
        let path = ParamPath::parse("binding_model.sma_nu[1:]").unwrap();
        let single = path.with_index(3).unwrap();
        assert_eq!(single.as_str(), "binding_model.sma_nu[3]");
        assert!(!single.is_multi());
    }

    #[test]
    fn resolve_reads_scalars_slices_and_list_items() {
        let r = root();
        let slice = ParamPath::parse("coeffs[1:3]").unwrap();
        assert_eq!(slice.resolve(&r).unwrap(), vec![1.0, 2.0]);

        let item = ParamPath::parse("leaves[1].rate").unwrap();
        assert_eq!(item.resolve(&r).unwrap(), vec![20.0]);

        let whole = ParamPath::parse("coeffs").unwrap();
        assert_eq!(whole.resolve(&r).unwrap().len(), 4);
    }

    #[test]
    fn assign_writes_every_sliced_slot() {
        let mut r = root();
        ParamPath::parse("coeffs[1:]")
            .unwrap()
            .assign(&mut r, 7.5)
            .unwrap();
        assert_eq!(r.coeffs, vec![0.0, 7.5, 7.5, 7.5]);

        ParamPath::parse("leaves[0].rate")
            .unwrap()
            .assign(&mut r, 1.5)
            .unwrap();
        assert_eq!(r.leaves[0].rate, 1.5);
        assert_eq!(r.leaves[1].rate, 20.0);
    }

    #[test]
    fn unknown_fields_and_bad_indices_are_config_errors() {
        let mut r = root();
        let err = ParamPath::parse("missing").unwrap().resolve(&r).unwrap_err();
        assert!(matches!(err, KrError::Config(msg) if msg.contains("coeffs")));

        assert!(ParamPath::parse("coeffs[9]").unwrap().validate(&r).is_err());
        assert!(ParamPath::parse("leaves[5].rate")
            .unwrap()
            .assign(&mut r, 1.0)
            .is_err());
        assert!(ParamPath::parse("leaves").unwrap().validate(&r).is_err());
        assert!(ParamPath::parse("coeffs[4:]").unwrap().validate(&r).is_err());
    }

    #[test]
    fn serde_round_trips_as_plain_string() {
        let path = ParamPath::parse("coeffs[1:]").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"coeffs[1:]\"");
        let back: ParamPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<ParamPath>("\"a[\"").is_err());
    }
}
