// SPDX-License-Identifier: AGPL-3.0-or-later

//! Validation findings produced for a single recipe file

use serde::Serialize;
use std::fmt;

/// What kind of script item a finding refers to
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Variable,
    Function,
    Array,
    Element,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Variable => write!(f, "variable"),
            ItemKind::Function => write!(f, "function"),
            ItemKind::Array => write!(f, "array"),
            ItemKind::Element => write!(f, "element"),
        }
    }
}

/// A single validation issue in a recipe
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Finding {
    /// Kind of item the finding is about
    pub kind: ItemKind,

    /// Variable or function name as written in the script
    pub name: String,

    /// Element index for findings inside arrays
    pub index: Option<usize>,

    /// Line of the item's first assignment, 0 when unknown
    pub line: u32,

    /// Message template; `{}` is replaced by the item reference
    pub message: String,

    /// Secondary explanation shown below the message
    pub extra: Option<String>,
}

impl Finding {
    pub fn new(kind: ItemKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            index: None,
            line: 0,
            message: message.into(),
            extra: None,
        }
    }

    pub fn variable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ItemKind::Variable, name, message)
    }

    pub fn element(name: impl Into<String>, index: usize, message: impl Into<String>) -> Self {
        let mut finding = Self::new(ItemKind::Element, name, message);
        finding.index = Some(index);
        finding
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Reference to the item, e.g. `` `sources[1]` element ``
    pub fn item_ref(&self, code: bool) -> String {
        let name = match self.index {
            Some(index) => format!("{}[{}]", self.name, index),
            None => self.name.clone(),
        };
        if code {
            format!("`{}` {}", name, self.kind)
        } else {
            format!("{} {}", name, self.kind)
        }
    }

    /// Primary message with the item reference substituted
    pub fn render(&self, code: bool) -> String {
        self.message.replacen("{}", &self.item_ref(code), 1)
    }

    /// Line suitable for anchoring a review comment
    pub fn reported_line(&self) -> u32 {
        self.line.max(1)
    }
}
