//! Identifier interning.
//!
//! The tokenizer interns every identifier into a [`Symbols`] table and works
//! with compact [`SymbolId`]s from then on; the parser, AST and compiler
//! compare names by id and only go back to the text for diagnostics.

use ahash::AHashMap;

/// Index into the symbol table.
///
/// `u32` keeps AST nodes small; a program will never approach 4 billion
/// distinct identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bijection between identifier strings and [`SymbolId`]s.
#[derive(Debug, Default)]
pub(crate) struct Symbols {
    names: Vec<Box<str>>,
    index: AHashMap<Box<str>, SymbolId>,
}

impl Symbols {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the existing id for `name` or inserts it.
    pub(crate) fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = SymbolId(u32::try_from(self.names.len()).unwrap_or(u32::MAX));
        self.names.push(name.into());
        self.index.insert(name.into(), id);
        id
    }

    pub(crate) fn name(&self, id: SymbolId) -> &str {
        &self.names[id.index()]
    }
}
