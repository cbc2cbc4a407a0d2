// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strong/weak reference counting with two lifetime modes (`spec.md` §4.1),
//! grounded in `original_source/binderlib/utils/RefBase.c`.
//!
//! The C original allocates a counter block that can outlive its payload, so
//! a weak reference can keep observing a destroyed object. This port bundles
//! the counter and the payload into one `Arc`-managed allocation and tracks
//! destruction as a logical flag instead of an actual deallocation: the
//! payload's memory is freed whenever the last `Arc` clone (strong or weak)
//! drops, but its lifecycle hooks fire at the same logical transitions the
//! original fires them at. `attemptIncStrong`'s original implementation has
//! a race-recovery branch for weak-lifetime objects that is not reproduced
//! here; this port instead follows the simpler contract `spec.md` itself
//! states for `attemptIncStrong` ("succeeds iff current strong is > 0 or the
//! object's `onIncStrongAttempted` hook returns true").
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

/// Sentinel strong value meaning "no strong reference has ever been taken",
/// matching `RefBase.c`'s `INITIAL_STRONG_VALUE` (`1 << 28`).
const INITIAL_STRONG_VALUE: i32 = 1 << 28;

/// Lifecycle hooks a reference-counted payload may implement.
pub trait RefCounted {
    /// Fires the first time a strong reference is taken.
    fn on_first_ref(&self) {}
    /// Fires when the strong count drops to zero.
    fn on_last_strong_ref(&self) {}
    /// Fires when the weak count drops to zero (weak-lifetime objects only).
    fn on_last_weak_ref(&self) {}
    /// Called by `attemptIncStrong` when the current strong count is not
    /// positive; returning `true` grants the upgrade anyway.
    fn on_inc_strong_attempted(&self) -> bool {
        false
    }
}

/// Selects which count governs destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Destroyed when strong reaches zero (the default).
    Strong,
    /// Destroyed only once both strong and weak reach zero.
    Weak,
}

struct Counter {
    strong: AtomicI32,
    weak: AtomicI32,
    lifetime: AtomicU8,
    destroyed: AtomicBool,
}

impl Counter {
    fn lifetime(&self) -> Lifetime {
        match self.lifetime.load(Ordering::Relaxed) {
            1 => Lifetime::Weak,
            _ => Lifetime::Strong,
        }
    }

    /// True if there is no real (non-sentinel, positive) strong reference.
    fn strong_is_absent(&self) -> bool {
        let s = self.strong.load(Ordering::Acquire);
        s <= 0 || s == INITIAL_STRONG_VALUE
    }
}

pub(crate) struct Node<T: RefCounted + ?Sized> {
    counter: Counter,
    value: T,
}

/// A strong reference: equivalent to holding one outstanding `incStrong`.
///
/// The inner `Arc` is `pub(crate)` so that call sites elsewhere in the
/// crate can perform the usual `Arc<Node<Concrete>>` -> `Arc<Node<dyn
/// Trait>>` unsizing coercion (e.g. upcasting a `Shared<RemoteObject>` to a
/// `Shared<dyn Binder>`) without this module naming every trait object it
/// might be asked to produce.
pub struct Shared<T: RefCounted + ?Sized>(pub(crate) Arc<Node<T>>);

/// A weak reference: keeps the counter block (and, transitively, the
/// payload allocation) alive without granting access to the payload.
pub struct WeakHandle<T: RefCounted + ?Sized>(pub(crate) Arc<Node<T>>);

impl<T: RefCounted> Shared<T> {
    /// Constructs a new object and immediately takes its first strong
    /// reference, firing `on_first_ref`.
    pub fn new(value: T) -> Self {
        let node = Arc::new(Node {
            counter: Counter {
                strong: AtomicI32::new(INITIAL_STRONG_VALUE),
                weak: AtomicI32::new(0),
                lifetime: AtomicU8::new(0),
                destroyed: AtomicBool::new(false),
            },
            value,
        });
        let shared = Shared(node);
        shared.inc_strong();
        shared
    }
}

impl<T: RefCounted + ?Sized> Shared<T> {
    /// Switches this object to weak-lifetime. Per `spec.md` §4.1 this must
    /// happen before any external reference is taken; callers that violate
    /// this are not defended against beyond the debug assertion below.
    pub fn extend_object_lifetime(&self) {
        debug_assert_eq!(
            self.strong_count(),
            1,
            "extend_object_lifetime called after an external reference was taken"
        );
        self.0.counter.lifetime.store(1, Ordering::Relaxed);
    }

    /// `incStrong`: always also increments weak; the first ever strong
    /// increment fires `on_first_ref`.
    pub fn inc_strong(&self) {
        inc_weak_raw(&self.0);
        let prev = self.0.counter.strong.fetch_add(1, Ordering::Relaxed);
        if prev == INITIAL_STRONG_VALUE {
            let old = self
                .0
                .counter
                .strong
                .fetch_sub(INITIAL_STRONG_VALUE, Ordering::Relaxed);
            debug_assert_eq!(old, INITIAL_STRONG_VALUE + 1);
            self.0.value.on_first_ref();
        } else {
            assert!(prev > 0, "incStrong() called on a destroyed object");
        }
    }

    /// `incStrongRequireStrong`: fatal unless a real strong reference
    /// already exists.
    pub fn inc_strong_require_strong(&self) {
        let cur = self.0.counter.strong.load(Ordering::Relaxed);
        assert!(
            cur > 0 && cur != INITIAL_STRONG_VALUE,
            "incStrongRequireStrong() called without an existing strong reference"
        );
        self.inc_strong();
    }

    /// `decStrong`: drops to zero fires `on_last_strong_ref` and, under
    /// strong-lifetime, marks the object logically destroyed. Always also
    /// decrements weak.
    fn dec_strong(&self) {
        let prev = self.0.counter.strong.fetch_sub(1, Ordering::Release);
        assert!(prev >= 1, "decStrong() count underflow");
        if prev == 1 {
            fence(Ordering::Acquire);
            self.0.value.on_last_strong_ref();
            if self.0.counter.lifetime() == Lifetime::Strong {
                self.0.counter.destroyed.store(true, Ordering::Release);
            }
        }
        dec_weak_raw(&self.0);
    }

    /// `attemptIncStrong`: upgrades iff the current strong count is a real
    /// positive count, or `on_inc_strong_attempted` grants it.
    fn attempt_inc_strong(node: &Arc<Node<T>>) -> bool {
        let mut cur = node.counter.strong.load(Ordering::Relaxed);
        loop {
            if cur > 0 && cur != INITIAL_STRONG_VALUE {
                match node.counter.strong.compare_exchange_weak(
                    cur,
                    cur + 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        inc_weak_raw(node);
                        return true;
                    }
                    Err(actual) => {
                        cur = actual;
                        continue;
                    }
                }
            }
            break;
        }
        if node.value.on_inc_strong_attempted() {
            inc_weak_raw(node);
            let prev = node.counter.strong.fetch_add(1, Ordering::Relaxed);
            if prev == INITIAL_STRONG_VALUE {
                let old = node
                    .counter
                    .strong
                    .fetch_sub(INITIAL_STRONG_VALUE, Ordering::Relaxed);
                debug_assert_eq!(old, INITIAL_STRONG_VALUE + 1);
                node.value.on_first_ref();
            }
            true
        } else {
            false
        }
    }

    /// `forceIncStrong`: like `inc_strong`, but also valid when the strong
    /// count is currently zero (reconstructing a strong reference from a
    /// driver-delivered handle).
    pub fn force_inc_strong(node: &WeakHandle<T>) -> Option<Shared<T>> {
        inc_weak_raw(&node.0);
        let prev = node.0.counter.strong.fetch_add(1, Ordering::Relaxed);
        match prev {
            p if p == INITIAL_STRONG_VALUE => {
                let old = node
                    .0
                    .counter
                    .strong
                    .fetch_sub(INITIAL_STRONG_VALUE, Ordering::Relaxed);
                debug_assert_eq!(old, INITIAL_STRONG_VALUE + 1);
                node.0.value.on_first_ref();
            }
            0 => node.0.value.on_first_ref(),
            _ => {}
        }
        Some(Shared(node.0.clone()))
    }

    /// `createWeak`: produces a weak handle sharing this counter block.
    pub fn downgrade(this: &Shared<T>) -> WeakHandle<T> {
        this.0.counter.weak.fetch_add(1, Ordering::Relaxed);
        WeakHandle(this.0.clone())
    }

    pub fn strong_count(&self) -> i32 {
        let s = self.0.counter.strong.load(Ordering::Relaxed);
        if s == INITIAL_STRONG_VALUE {
            0
        } else {
            s
        }
    }

    pub fn weak_count(&self) -> i32 {
        self.0.counter.weak.load(Ordering::Relaxed)
    }

    pub fn ptr_eq(a: &Shared<T>, b: &Shared<T>) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl<T: RefCounted + ?Sized> std::ops::Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0.value
    }
}

impl<T: RefCounted + ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        self.inc_strong();
        Shared(self.0.clone())
    }
}

impl<T: RefCounted + ?Sized> Drop for Shared<T> {
    fn drop(&mut self) {
        self.dec_strong();
    }
}

impl<T: RefCounted + ?Sized> WeakHandle<T> {
    /// `attemptIncStrong` entry point reachable from the weak side.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        if Shared::attempt_inc_strong(&self.0) {
            Some(Shared(self.0.clone()))
        } else {
            None
        }
    }

    /// `attemptIncWeak`: fails once the object is logically destroyed.
    pub fn attempt_inc_weak(&self) -> Option<WeakHandle<T>> {
        if self.0.counter.destroyed.load(Ordering::Acquire) {
            None
        } else {
            inc_weak_raw(&self.0);
            Some(WeakHandle(self.0.clone()))
        }
    }

    pub fn ptr_eq(a: &WeakHandle<T>, b: &WeakHandle<T>) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl<T: RefCounted + ?Sized> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        inc_weak_raw(&self.0);
        WeakHandle(self.0.clone())
    }
}

impl<T: RefCounted + ?Sized> Drop for WeakHandle<T> {
    fn drop(&mut self) {
        dec_weak_raw(&self.0);
    }
}

fn inc_weak_raw<T: RefCounted + ?Sized>(node: &Arc<Node<T>>) {
    node.counter.weak.fetch_add(1, Ordering::Relaxed);
}

/// `decWeak`, shared by `Shared::dec_strong`'s implicit tail call and
/// `WeakHandle::drop`.
fn dec_weak_raw<T: RefCounted + ?Sized>(node: &Arc<Node<T>>) {
    let prev = node.counter.weak.fetch_sub(1, Ordering::Release);
    assert!(prev >= 1, "decWeak() count underflow");
    if prev == 1 {
        fence(Ordering::Acquire);
        if node.counter.lifetime() == Lifetime::Weak && node.counter.strong_is_absent() {
            if !node.counter.destroyed.swap(true, Ordering::AcqRel) {
                node.value.on_last_weak_ref();
            }
        }
    }
}

impl<T: RefCounted + fmt::Debug + ?Sized> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .field("value", &self.0.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Probe {
        first_ref: AtomicUsize,
        last_strong_ref: AtomicUsize,
        last_weak_ref: AtomicUsize,
    }

    impl RefCounted for Probe {
        fn on_first_ref(&self) {
            self.first_ref.fetch_add(1, Ordering::SeqCst);
        }
        fn on_last_strong_ref(&self) {
            self.last_strong_ref.fetch_add(1, Ordering::SeqCst);
        }
        fn on_last_weak_ref(&self) {
            self.last_weak_ref.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn first_ref_fires_exactly_once() {
        let obj = Shared::new(Probe::default());
        let clone_a = obj.clone();
        let clone_b = obj.clone();
        assert_eq!(obj.first_ref.load(Ordering::SeqCst), 1);
        drop(clone_a);
        drop(clone_b);
        drop(obj);
    }

    #[test]
    fn last_strong_ref_fires_once_on_final_drop() {
        let obj = Shared::new(Probe::default());
        let clone = obj.clone();
        drop(clone);
        assert_eq!(obj.last_strong_ref.load(Ordering::SeqCst), 0);
        drop(obj);
    }

    #[test]
    fn weak_upgrade_fails_after_final_strong_drop_under_strong_lifetime() {
        let obj = Shared::new(Probe::default());
        let weak = Shared::downgrade(&obj);
        drop(obj);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_upgrade_succeeds_while_strong_alive() {
        let obj = Shared::new(Probe::default());
        let weak = Shared::downgrade(&obj);
        let upgraded = weak.upgrade().expect("object still alive");
        assert!(Shared::ptr_eq(&obj, &upgraded));
    }

    #[test]
    fn weak_lifetime_object_survives_strong_drop_until_weak_also_drops() {
        let obj = Shared::new(Probe::default());
        obj.extend_object_lifetime();
        let weak = Shared::downgrade(&obj);
        drop(obj);
        assert_eq!(weak.last_weak_ref.load(Ordering::SeqCst), 0);
        drop(weak);
    }
}
