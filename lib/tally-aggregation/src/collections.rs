//! Hash collections.

/// Build hasher used by every hash collection in this crate.
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A hash set based on `hashbrown` ([`HashSet`][hashbrown::HashSet]) using [`FastBuildHasher`].
pub type FastHashSet<T> = hashbrown::HashSet<T, FastBuildHasher>;

/// A hash map based on `hashbrown` ([`HashMap`][hashbrown::HashMap]) using [`FastBuildHasher`].
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;
