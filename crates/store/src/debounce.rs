//! Query input task: owns a [`QueryState`] and turns UI events into a stream
//! of QuerySpecs, holding search keystrokes back until input goes quiet.

#![forbid(unsafe_code)]

use tabula_core::{FilterValue, QuerySpec};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::query_state::QueryState;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    /// Raw text of the search box after a keystroke.
    Search(String),
    Filter(String, Option<FilterValue>),
    /// Column header clicked.
    Sort(String),
    PageSize(u32),
    Clear,
    /// Commit pending search text now.
    Flush,
}

#[derive(Clone)]
pub struct QueryInputHandle {
    tx: mpsc::UnboundedSender<QueryInput>,
}

impl QueryInputHandle {
    /// Returns false once the input task has stopped.
    pub fn send(&self, input: QueryInput) -> bool { self.tx.send(input).is_ok() }

    pub fn search(&self, text: impl Into<String>) -> bool { self.send(QueryInput::Search(text.into())) }

    pub fn filter(&self, key: impl Into<String>, value: Option<FilterValue>) -> bool {
        self.send(QueryInput::Filter(key.into(), value))
    }
}

/// Spawn the input task. Dropping every handle stops it; a pending search is
/// flushed first so the last keystrokes are not lost.
pub fn spawn_query_input(state: QueryState) -> (QueryInputHandle, mpsc::UnboundedReceiver<QuerySpec>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueryInput>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<QuerySpec>();
    let task = tokio::spawn(async move {
        let mut state = state;
        loop {
            let deadline = state.deadline();
            let input = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => {
                        if let Some(q) = state.flush() { let _ = out_tx.send(q); }
                        break;
                    }
                },
                _ = async {
                    match deadline {
                        Some(d) => sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Some(q) = state.poll(Instant::now()) {
                        debug!(search = ?q.search(), "query: debounced search committed");
                        if out_tx.send(q).is_err() { break; }
                    }
                    continue;
                }
            };
            trace!(input = ?input, "query: input");
            let emitted = match input {
                QueryInput::Search(text) => { state.type_search(&text, Instant::now()); None }
                QueryInput::Filter(k, v) => state.set_filter(&k, v),
                QueryInput::Sort(field) => state.toggle_sort(&field),
                QueryInput::PageSize(n) => state.set_page_size(n),
                QueryInput::Clear => state.clear_filters(),
                QueryInput::Flush => state.flush(),
            };
            if let Some(q) = emitted {
                if out_tx.send(q).is_err() { break; }
            }
        }
        debug!("query: input task stopped");
    });
    (QueryInputHandle { tx }, out_rx, task)
}
