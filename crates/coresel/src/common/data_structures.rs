use fxhash::FxBuildHasher;

// Engine tables are keyed by small integer ids (jobs, nodes, cores), so the
// fast fxhash hasher replaces the default SipHash everywhere. Construct with
// `default()`; `new()` is tied to hashbrown's own default hasher.
pub type Map<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, FxBuildHasher>;
