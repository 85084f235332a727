//! Leaf types shared by the JIT engine: interned symbol names and the
//! address/flags pairs they resolve to.

#![deny(clippy::unwrap_used)]

mod jit_symbol;
mod symbol_string_pool;

pub use jit_symbol::{EvaluatedSymbol, ExecutorAddr, JitSymbolFlags};
pub use symbol_string_pool::{SymbolStringPool, SymbolStringPtr};
