//! Least-recently-used eviction keeping the pool under its global cap.
//!
//! Victims are chosen by the oldest `last_response_at`, preferring servers
//! that have answered at least once and are not already unhealthy (those
//! are the health controller's problem). Eviction is an ordinary graceful
//! shutdown: the next query for the evicted language respawns it, so the
//! cap only costs latency, never correctness.

use std::{collections::HashMap, sync::atomic::Ordering, sync::Arc, time::Duration};

use tracing::info;

use crate::{
    process::{unix_millis, ProcessState},
    supervisor::{self, LanguageEntry, Shared},
    Error,
};

/// Makes room for one more process, evicting LRU victims while the pool is
/// at or over the cap.
pub(crate) async fn ensure_capacity(shared: &Arc<Shared>) -> Result<(), Error> {
    loop {
        let victim = {
            let pool = shared.pool.read().await;
            let cap = shared.max_processes.load(Ordering::SeqCst);
            if pool.len() < cap {
                return Ok(());
            }
            select_victim(&pool)
        };
        let Some(language) = victim else {
            return Ok(());
        };
        info!(language, "evicting least recently used server");
        supervisor::remove_and_teardown(shared, &language).await;
    }
}

/// Shuts down every server whose most recent reply is older than
/// `older_than`; servers that never replied count as idle. Returns the
/// evicted languages.
pub(crate) async fn evict_idle(shared: &Arc<Shared>, older_than: Duration) -> Vec<String> {
    let threshold = unix_millis().saturating_sub(older_than.as_millis() as u64);
    let victims: Vec<String> = {
        let pool = shared.pool.read().await;
        pool.iter()
            .filter(|(_, entry)| entry.process.last_response_at_millis() < threshold)
            .map(|(language, _)| language.clone())
            .collect()
    };
    for language in &victims {
        info!(language, "evicting idle server");
        supervisor::remove_and_teardown(shared, language).await;
    }
    victims
}

/// Updates the global cap, evicting LRU victims until the pool fits.
pub(crate) async fn set_max_processes(shared: &Arc<Shared>, cap: usize) -> Result<(), Error> {
    if cap == 0 {
        return Err(Error::InvalidConfig(
            "max_total_processes must be at least 1".into(),
        ));
    }
    shared.max_processes.store(cap, Ordering::SeqCst);
    loop {
        let victim = {
            let pool = shared.pool.read().await;
            if pool.len() <= cap {
                return Ok(());
            }
            select_victim(&pool)
        };
        let Some(language) = victim else {
            return Ok(());
        };
        info!(language, cap, "evicting server to honor lowered cap");
        supervisor::remove_and_teardown(shared, &language).await;
    }
}

/// Languages in eviction order, for observability.
pub(crate) async fn eviction_candidates(shared: &Arc<Shared>) -> Vec<String> {
    let entries: Vec<(String, u64)> = {
        let pool = shared.pool.read().await;
        pool.iter()
            .map(|(language, entry)| (language.clone(), entry.process.last_response_at_millis()))
            .collect()
    };
    order_candidates(entries)
}

fn select_victim(pool: &HashMap<String, LanguageEntry>) -> Option<String> {
    let candidates: Vec<(String, u64, bool)> = pool
        .iter()
        .map(|(language, entry)| {
            (
                language.clone(),
                entry.process.last_response_at_millis(),
                entry.process.state() == ProcessState::Unhealthy,
            )
        })
        .collect();
    pick_victim(&candidates)
}

/// LRU victim over `(language, last_response_millis, unhealthy)` triples:
/// the oldest responder that is not unhealthy, falling back to any entry
/// when nobody qualifies.
pub(crate) fn pick_victim(candidates: &[(String, u64, bool)]) -> Option<String> {
    let mut best: Option<(&str, u64)> = None;
    for (language, last, unhealthy) in candidates {
        if *last == 0 || *unhealthy {
            continue;
        }
        if best.map_or(true, |(_, oldest)| *last < oldest) {
            best = Some((language, *last));
        }
    }
    if let Some((language, _)) = best {
        return Some(language.to_string());
    }
    candidates.first().map(|(language, _, _)| language.clone())
}

/// Sorts `(language, last_response_millis)` pairs into LRU order: oldest
/// reply first, never-replied entries last.
pub(crate) fn order_candidates(mut entries: Vec<(String, u64)>) -> Vec<String> {
    entries.sort_by_key(|(_, last)| if *last == 0 { u64::MAX } else { *last });
    entries.into_iter().map(|(language, _)| language).collect()
}
