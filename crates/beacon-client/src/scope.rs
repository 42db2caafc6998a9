//! Scope stack limiting how many items one logical operation may report.
//!
//! Scopes live in an arena owned by the current task: the one installed by
//! [`with_scope_stack`], or else one keyed by the tokio task id. Code running
//! outside any tokio task falls back to a per-thread arena. A scope
//! refers to its parent by arena index only; the [`ScopeGuard`] returned by
//! [`push_scope`] pops back to the parent when dropped.
//!
//! ```text
//!  push_scope("request")  ──▶ [0] request            current = 0
//!  push_scope("query")    ──▶ [1] query  parent = 0  current = 1
//!  drop(query guard)      ──▶ [0] request            current = 0
//! ```

use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        LazyLock, Mutex, PoisonError,
    },
};

use serde_json::Value;

tokio::task_local! {
    static TASK_SCOPES: RefCell<ScopeArena>;
}

thread_local! {
    static THREAD_SCOPES: RefCell<ScopeArena> = RefCell::new(ScopeArena::default());
}

/// Arenas of spawned tasks that never entered [`with_scope_stack`]. Tasks can
/// move between worker threads, so these cannot be thread-local.
static SPAWNED_SCOPES: LazyLock<Mutex<HashMap<tokio::task::Id, ScopeArena>>> =
    LazyLock::new(Mutex::default);

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Result of asking the current scope to admit one more item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The item may be reported.
    Admitted,
    /// This item hit the limit; report a single warning instead of it.
    LimitReached,
    /// The limit was hit earlier; suppress silently.
    OverLimit,
}

impl Admission {
    /// True if the item itself may be reported.
    pub fn is_admitted(self) -> bool {
        self == Self::Admitted
    }
}

/// Copy of a scope record at the time it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSnapshot {
    /// Scope name, usually the logger that opened it.
    pub name: String,
    /// State the scope was opened with.
    pub state: Value,
    /// Items admitted in this scope so far, including the one that hit the
    /// limit and every suppressed one after it.
    pub log_items_count: u32,
    /// Number of enclosing scopes.
    pub depth: usize,
}

#[derive(Debug)]
struct ScopeRecord {
    id: u64,
    name: String,
    state: Value,
    log_items_count: u32,
    parent: Option<usize>,
    open: bool,
}

#[derive(Debug, Default)]
struct ScopeArena {
    records: Vec<ScopeRecord>,
    current: Option<usize>,
}

impl ScopeArena {
    fn push(&mut self, name: String, state: Value) -> (usize, u64) {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        let index = self.records.len();
        self.records.push(ScopeRecord {
            id,
            name,
            state,
            log_items_count: 0,
            parent: self.current,
            open: true,
        });
        self.current = Some(index);
        (index, id)
    }

    fn pop(&mut self, index: usize, id: u64) {
        let parent = match self.records.get_mut(index) {
            Some(record) if record.id == id && record.open => {
                record.open = false;
                record.parent
            },
            _ => return,
        };

        if self.current == Some(index) {
            self.current = self.nearest_open(parent);
        }
        // Parents always sit below their children, so trailing closed
        // records are unreachable.
        while self.records.last().is_some_and(|record| !record.open) {
            self.records.pop();
        }
    }

    /// Walks up from `start` to the first scope that is still open.
    ///
    /// Guards dropped out of order leave closed records in the chain.
    fn nearest_open(&self, mut start: Option<usize>) -> Option<usize> {
        while let Some(record) = start.and_then(|index| self.records.get(index)) {
            if record.open {
                return start;
            }
            start = record.parent;
        }
        None
    }

    fn admit(&mut self, max_items: u32) -> Admission {
        if max_items == 0 {
            return Admission::Admitted;
        }
        let Some(record) = self.current.and_then(|index| self.records.get_mut(index)) else {
            return Admission::Admitted;
        };

        record.log_items_count = record.log_items_count.saturating_add(1);
        match record.log_items_count.cmp(&max_items) {
            std::cmp::Ordering::Less => Admission::Admitted,
            std::cmp::Ordering::Equal => Admission::LimitReached,
            std::cmp::Ordering::Greater => Admission::OverLimit,
        }
    }

    fn snapshot(&self) -> Option<ScopeSnapshot> {
        let record = self.records.get(self.current?)?;
        Some(ScopeSnapshot {
            name: record.name.clone(),
            state: record.state.clone(),
            log_items_count: record.log_items_count,
            depth: self.lineage().len().saturating_sub(1),
        })
    }

    fn lineage(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut next = self.current;
        while let Some(record) = next.and_then(|index| self.records.get(index)) {
            names.push(record.name.clone());
            next = self.nearest_open(record.parent);
        }
        names
    }
}

/// Which arena a scope operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    /// Installed by [`with_scope_stack`].
    Stack,
    /// A spawned task without a scope stack of its own.
    Task(tokio::task::Id),
    /// Not running inside a tokio task.
    Thread,
}

impl Owner {
    fn current() -> Self {
        if TASK_SCOPES.try_with(|_| ()).is_ok() {
            Self::Stack
        } else if let Some(id) = tokio::task::try_id() {
            Self::Task(id)
        } else {
            Self::Thread
        }
    }
}

fn with_owner_arena<R>(owner: Owner, f: impl FnOnce(&mut ScopeArena) -> R) -> Option<R> {
    match owner {
        Owner::Stack => TASK_SCOPES.try_with(|arena| f(&mut arena.borrow_mut())).ok(),
        Owner::Task(id) => {
            let mut arenas = SPAWNED_SCOPES.lock().unwrap_or_else(PoisonError::into_inner);
            let arena = arenas.entry(id).or_default();
            let result = f(arena);
            if arena.records.is_empty() {
                arenas.remove(&id);
            }
            Some(result)
        },
        Owner::Thread => Some(THREAD_SCOPES.with(|arena| f(&mut arena.borrow_mut()))),
    }
}

fn with_arena<R: Default>(f: impl FnOnce(&mut ScopeArena) -> R) -> R {
    with_owner_arena(Owner::current(), f).unwrap_or_default()
}

/// Handle to an open scope; dropping it makes the parent current again.
///
/// The guard remembers the arena it was opened in. Inside a tokio task it may
/// be held across `.await`. Outside of any task, scopes are per thread and the
/// guard must be dropped on the thread that created it.
#[derive(Debug)]
#[must_use = "the scope closes as soon as the guard is dropped"]
pub struct ScopeGuard {
    owner: Owner,
    index: usize,
    id: u64,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let (index, id) = (self.index, self.id);
        with_owner_arena(self.owner, |arena| arena.pop(index, id));
    }
}

/// Opens a scope nested in the current one and makes it current.
pub fn push_scope(name: impl Into<String>, state: Value) -> ScopeGuard {
    let owner = Owner::current();
    let (index, id) =
        with_owner_arena(owner, |arena| arena.push(name.into(), state)).unwrap_or_default();
    ScopeGuard { owner, index, id }
}

/// The scope items are currently counted against.
pub fn current_scope() -> Option<ScopeSnapshot> {
    with_arena(|arena| arena.snapshot())
}

/// Names of the open scopes, innermost first.
pub fn lineage() -> Vec<String> {
    with_arena(|arena| arena.lineage())
}

/// Counts one item against the current scope.
///
/// Without a current scope, or with `max_items == 0`, every item is admitted.
pub fn admit(max_items: u32) -> Admission {
    with_owner_arena(Owner::current(), |arena| arena.admit(max_items))
        .unwrap_or(Admission::Admitted)
}

/// Runs `future` with a scope stack of its own.
///
/// Scopes pushed inside stay with the task across `.await` points and worker
/// threads, and never leak into other tasks.
pub async fn with_scope_stack<F: Future>(future: F) -> F::Output {
    TASK_SCOPES.scope(RefCell::new(ScopeArena::default()), future).await
}
