use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

// ---------------------------------------------------------------------------
// Session-wide symbol string pool
// ---------------------------------------------------------------------------

struct PoolInner {
    entries: RwLock<FxHashMap<Arc<str>, Weak<PoolEntry>>>,
}

struct PoolEntry {
    text: Arc<str>,
    pool: Weak<PoolInner>,
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let this: *const PoolEntry = self;
        let mut entries = pool.entries.write();
        // A concurrent intern may already have replaced the dead slot with a
        // fresh entry for the same text; only erase our own slot.
        if entries
            .get(&self.text)
            .is_some_and(|slot| std::ptr::eq(slot.as_ptr(), this))
        {
            entries.remove(&self.text);
        }
    }
}

/// Interning table for symbol names.
///
/// Every call to [`SymbolStringPool::intern`] hands out one owned reference
/// to the unique entry for that text. The reference is released when the
/// returned [`SymbolStringPtr`] is dropped, and the entry is erased from the
/// pool once its last reference goes away. There is no manual retain or
/// release bookkeeping for callers.
///
/// Cloning a pool clones the handle, not the table.
#[derive(Clone)]
pub struct SymbolStringPool {
    inner: Arc<PoolInner>,
}

impl SymbolStringPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Intern `text`, returning a new reference to its unique entry.
    pub fn intern(&self, text: &str) -> SymbolStringPtr {
        // Fast-path: live entry under a read lock.
        {
            let entries = self.inner.entries.read();
            if let Some(entry) = entries.get(text).and_then(Weak::upgrade) {
                return SymbolStringPtr(entry);
            }
        }
        let mut entries = self.inner.entries.write();
        // Double-check after acquiring the write lock.
        if let Some(entry) = entries.get(text).and_then(Weak::upgrade) {
            return SymbolStringPtr(entry);
        }
        let text: Arc<str> = Arc::from(text);
        let entry = Arc::new(PoolEntry {
            text: text.clone(),
            pool: Arc::downgrade(&self.inner),
        });
        entries.insert(text, Arc::downgrade(&entry));
        SymbolStringPtr(entry)
    }

    /// Whether a live entry exists for `text`.
    pub fn contains(&self, text: &str) -> bool {
        self.inner
            .entries
            .read()
            .get(text)
            .is_some_and(|slot| slot.strong_count() > 0)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release one reference; the entry is erased once no references remain.
    pub fn release(&self, entry: SymbolStringPtr) {
        entry.release();
    }

    /// Whether both handles refer to the same table.
    pub fn ptr_eq(&self, other: &SymbolStringPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether `entry` was interned by this pool.
    pub fn owns(&self, entry: &SymbolStringPtr) -> bool {
        std::ptr::eq(entry.0.pool.as_ptr(), Arc::as_ptr(&self.inner))
    }
}

impl Default for SymbolStringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SymbolStringPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolStringPool")
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pool references
// ---------------------------------------------------------------------------

/// An owned reference to an interned symbol name.
///
/// Two `SymbolStringPtr`s compare equal if and only if they refer to the same
/// pool entry; hashing is by identity as well. Cloning takes another
/// reference, dropping releases one.
#[derive(Clone)]
pub struct SymbolStringPtr(Arc<PoolEntry>);

impl SymbolStringPtr {
    /// Read-only view of the interned text.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// Number of live references to this entry, this one included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Give up this reference. Same as dropping it.
    pub fn release(self) {}
}

impl PartialEq for SymbolStringPtr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SymbolStringPtr {}

impl Hash for SymbolStringPtr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl PartialOrd for SymbolStringPtr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SymbolStringPtr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str()
            .cmp(other.as_str())
            .then_with(|| Arc::as_ptr(&self.0).cmp(&Arc::as_ptr(&other.0)))
    }
}

impl PartialEq<str> for SymbolStringPtr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for SymbolStringPtr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl AsRef<str> for SymbolStringPtr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for SymbolStringPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolStringPtr({:?})", self.as_str())
    }
}

impl fmt::Display for SymbolStringPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
