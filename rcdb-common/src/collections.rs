//! Hash collection aliases.
//!
//! Keys in this workspace are small integers and short registry names, so
//! every map uses `rustc_hash` instead of the SipHash default.

pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
