// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Thread-scoped profiling labels.
//!
//! Each thread owns an ambient label map (labels added with
//! [`Tagger::add_tag`](super::Tagger::add_tag), kept until the thread exits)
//! and a stack of scoped labels. Scoped labels override ambient ones with the
//! same key, and later scopes override earlier ones.
//!
//! The effective label set of every labelled thread is mirrored into a
//! process-wide registry keyed by the same thread id the CPU sampler records,
//! so collected samples can be attributed to the labels of the thread they
//! were taken on.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{LazyLock, Mutex, PoisonError},
};

/// An ordered set of `key=value` labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl FromIterator<(String, String)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        LabelSet(iter.into_iter().collect())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

static REGISTRY: LazyLock<Mutex<HashMap<u64, LabelSet>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Identifies one pushed scoped label on the thread that pushed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScopeId(u64);

struct ThreadLabels {
    ambient: BTreeMap<String, String>,
    scoped: Vec<(ScopeId, String, String)>,
    next_id: u64,
    published: bool,
}

impl ThreadLabels {
    fn current(&self) -> LabelSet {
        let mut set = LabelSet(self.ambient.clone());
        for (_, k, v) in &self.scoped {
            set.insert(k.clone(), v.clone());
        }
        set
    }

    fn publish(&mut self) {
        let current = self.current();
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_empty() {
            if self.published {
                registry.remove(&thread_id());
                self.published = false;
            }
        } else {
            registry.insert(thread_id(), current);
            self.published = true;
        }
    }
}

impl Drop for ThreadLabels {
    fn drop(&mut self) {
        if self.published {
            REGISTRY
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&thread_id());
        }
    }
}

thread_local! {
    static LABELS: RefCell<ThreadLabels> = const {
        RefCell::new(ThreadLabels {
            ambient: BTreeMap::new(),
            scoped: Vec::new(),
            next_id: 0,
            published: false,
        })
    };
}

/// The labels currently in effect on the calling thread.
pub fn current() -> LabelSet {
    LABELS
        .try_with(|labels| labels.borrow().current())
        .unwrap_or_default()
}

pub(crate) fn insert_ambient(key: &str, value: &str) {
    let _ = LABELS.try_with(|labels| {
        let mut labels = labels.borrow_mut();
        labels.ambient.insert(key.to_owned(), value.to_owned());
        labels.publish();
    });
}

/// Pushes a scoped label. `None` once the thread is tearing down.
pub(crate) fn push(key: &str, value: &str) -> Option<ScopeId> {
    LABELS
        .try_with(|labels| {
            let mut labels = labels.borrow_mut();
            let id = ScopeId(labels.next_id);
            labels.next_id += 1;
            labels.scoped.push((id, key.to_owned(), value.to_owned()));
            labels.publish();
            id
        })
        .ok()
}

/// Removes the scoped label pushed as `id`, wherever it sits in the stack.
pub(crate) fn remove(id: ScopeId) {
    let _ = LABELS.try_with(|labels| {
        let mut labels = labels.borrow_mut();
        if let Some(pos) = labels.scoped.iter().rposition(|(i, _, _)| *i == id) {
            labels.scoped.remove(pos);
            labels.publish();
        }
    });
}

/// Removes the innermost scoped label with this key, uncovering any outer one.
pub(crate) fn pop_scoped(key: &str) {
    let _ = LABELS.try_with(|labels| {
        let mut labels = labels.borrow_mut();
        if let Some(pos) = labels.scoped.iter().rposition(|(_, k, _)| k == key) {
            labels.scoped.remove(pos);
            labels.publish();
        }
    });
}

/// Label sets of every currently labelled thread, keyed by sampler thread id.
pub(crate) fn snapshot() -> HashMap<u64, LabelSet> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// The id the CPU sampler records for the calling thread.
#[cfg(unix)]
pub(crate) fn thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
pub(crate) fn thread_id() -> u64 {
    0
}
