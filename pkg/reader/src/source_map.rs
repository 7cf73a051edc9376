use std::collections::HashMap;

use value::Value;

/// Byte-span record for a parsed value, shaped like the value it describes:
/// atoms get a bare span, sequence aggregates carry one entry per element,
/// associative aggregates are keyed by the original key value and carry the
/// key span and value span of each entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMap {
    Atom {
        start: usize,
        end: usize,
    },
    Seq {
        start: usize,
        end: usize,
        elems: Vec<SourceMap>,
    },
    Assoc {
        start: usize,
        end: usize,
        entries: HashMap<Value, (SourceMap, SourceMap)>,
    },
}

impl SourceMap {
    pub fn span(&self) -> (usize, usize) {
        match self {
            SourceMap::Atom { start, end }
            | SourceMap::Seq { start, end, .. }
            | SourceMap::Assoc { start, end, .. } => (*start, *end),
        }
    }

    pub fn start(&self) -> usize {
        self.span().0
    }

    pub fn end(&self) -> usize {
        self.span().1
    }

    /// Sub-map of element `index` of a tuple or array mapping.
    pub fn index(&self, index: usize) -> Option<&SourceMap> {
        match self {
            SourceMap::Seq { elems, .. } => elems.get(index),
            _ => None,
        }
    }

    /// Sub-map of the *key* stored at `key` in a struct or table mapping.
    pub fn key(&self, key: &Value) -> Option<&SourceMap> {
        match self {
            SourceMap::Assoc { entries, .. } => entries.get(key).map(|(k, _)| k),
            _ => None,
        }
    }

    /// Sub-map of the *value* stored at `key` in a struct or table mapping.
    pub fn value_of(&self, key: &Value) -> Option<&SourceMap> {
        match self {
            SourceMap::Assoc { entries, .. } => entries.get(key).map(|(_, v)| v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_reject_shape_mismatches() {
        let atom = SourceMap::Atom { start: 0, end: 1 };
        assert_eq!(atom.index(0), None);
        assert_eq!(atom.key(&Value::Nil), None);
        assert_eq!(atom.value_of(&Value::Nil), None);

        let seq = SourceMap::Seq {
            start: 0,
            end: 3,
            elems: vec![SourceMap::Atom { start: 1, end: 2 }],
        };
        assert_eq!(seq.index(0), Some(&SourceMap::Atom { start: 1, end: 2 }));
        assert_eq!(seq.index(1), None);
        assert_eq!(seq.key(&Value::Integer(0)), None);
    }
}
