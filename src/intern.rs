use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Process wide string table. Label names, variable names and runtime helper
/// names all resolve through here so symbols compare by index.
#[derive(Debug, Default)]
pub struct InterningTable {
    strings: RwLock<Vec<&'static str>>,
}

pub static INTERNING_TABLE: Lazy<Arc<InterningTable>> = Lazy::new(Default::default);

impl InterningTable {
    pub fn get(&self, index: u32) -> Option<&'static str> {
        let strings = self.strings.read().unwrap_or_else(|e| e.into_inner());

        strings.get(index as usize).copied()
    }

    pub fn insert_if_absent(&self, string: &str) -> u32 {
        let mut strings = self.strings.write().unwrap_or_else(|e| e.into_inner());

        // checked under the write lock so two threads interning the same
        // string cannot both append it
        if let Some(index) = strings.iter().position(|s| *s == string) {
            return index as _;
        }

        strings.push(Box::leak(string.to_owned().into_boxed_str()));
        (strings.len() - 1) as _
    }
}

/// An index into the string interning table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedSymbol(u32);

impl InternedSymbol {
    pub fn new(value: &str) -> Self {
        let index = INTERNING_TABLE.insert_if_absent(value);

        Self(index)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn value(&self) -> &'static str {
        // Once a symbol is handed out its string is never removed
        INTERNING_TABLE.get(self.0).unwrap_or("<invalid symbol>")
    }
}

impl core::fmt::Debug for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InternedSymbol")
            .field(&self.0)
            .field(&self.value())
            .finish()
    }
}

impl core::fmt::Display for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let a = InternedSymbol::new("ifaces2i");
        let b = InternedSymbol::new("ifaces2i");
        let c = InternedSymbol::new("ifacei2i");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.value(), "ifaces2i");
    }
}
