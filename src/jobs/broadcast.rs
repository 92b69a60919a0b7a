//! Durable-cursor event streaming for job subscribers.
//!
//! A subscriber replays the event log from `since_event_id`, then switches
//! to a live tail. The log is authoritative: a dropped connection simply
//! reconnects with the last id it saw.

use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::store::jobs::JobEventRow;
use crate::store::ResearchStore;
use crate::types::JobId;

const PAGE_SIZE: usize = 100;

struct TailState {
    store: Arc<ResearchStore>,
    job_id: JobId,
    cursor: i64,
    buffer: VecDeque<JobEventRow>,
    poll: Duration,
    done: bool,
}

/// Stream a job's events from `since_event_id` (exclusive) until the job is
/// terminal and the log is drained.
pub fn event_stream(
    store: Arc<ResearchStore>,
    job_id: JobId,
    since_event_id: i64,
    poll: Duration,
) -> BoxStream<'static, JobEventRow> {
    let state = TailState {
        store,
        job_id,
        cursor: since_event_id,
        buffer: VecDeque::new(),
        poll,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.buffer.pop_front() {
                state.cursor = event.id;
                return Some((event, state));
            }
            if state.done {
                return None;
            }

            match state
                .store
                .get_job_events(&state.job_id, state.cursor, PAGE_SIZE)
                .await
            {
                Ok(events) if !events.is_empty() => {
                    state.buffer.extend(events);
                    continue;
                }
                Ok(_) => {
                    // Page empty: end once the job is terminal, otherwise
                    // wait for the live tail.
                    let terminal = match state.store.get_job(&state.job_id).await {
                        Ok(Some(job)) => job.status.is_terminal(),
                        Ok(None) => true,
                        Err(e) => {
                            tracing::warn!(job_id = %state.job_id, "tail status check failed: {e}");
                            false
                        }
                    };
                    if terminal {
                        // One final page guards against events appended
                        // between the empty page and the status check.
                        if let Ok(final_events) = state
                            .store
                            .get_job_events(&state.job_id, state.cursor, PAGE_SIZE)
                            .await
                        {
                            if !final_events.is_empty() {
                                state.buffer.extend(final_events);
                                continue;
                            }
                        }
                        state.done = true;
                        continue;
                    }
                    tokio::time::sleep(state.poll).await;
                }
                Err(e) => {
                    tracing::warn!(job_id = %state.job_id, "event page fetch failed: {e}");
                    tokio::time::sleep(state.poll).await;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ResearchEvent;
    use crate::store::testutil::memory_store;
    use crate::types::JobStatus;
    use futures::StreamExt;

    async fn seeded_job(store: &Arc<ResearchStore>, events: usize) -> JobId {
        let created = store
            .create_job("research", serde_json::json!({}), None)
            .await
            .unwrap();
        let job_id = created.job_id().clone();
        for i in 0..events {
            store
                .append_job_event(
                    &job_id,
                    &ResearchEvent::UiHint {
                        message: format!("step {i}"),
                    },
                )
                .await
                .unwrap();
        }
        job_id
    }

    #[tokio::test]
    async fn replays_then_ends_on_terminal_job() {
        let store = memory_store().await;
        let job_id = seeded_job(&store, 5).await;
        store
            .set_job_status(&job_id, JobStatus::Succeeded, None, true)
            .await
            .unwrap();

        let events: Vec<JobEventRow> = event_stream(
            store.clone(),
            job_id,
            0,
            Duration::from_millis(10),
        )
        .collect()
        .await;
        assert_eq!(events.len(), 5);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn resume_skips_already_seen_events() {
        let store = memory_store().await;
        let job_id = seeded_job(&store, 6).await;
        store
            .set_job_status(&job_id, JobStatus::Failed, None, true)
            .await
            .unwrap();

        // First subscriber reads three events and disconnects.
        let mut stream = event_stream(
            store.clone(),
            job_id.clone(),
            0,
            Duration::from_millis(10),
        );
        let mut last_id = 0;
        for _ in 0..3 {
            last_id = stream.next().await.unwrap().id;
        }
        drop(stream);

        // Reconnect with since_event_id: nothing ≤ last_id is delivered.
        let rest: Vec<JobEventRow> = event_stream(
            store.clone(),
            job_id,
            last_id,
            Duration::from_millis(10),
        )
        .collect()
        .await;
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|e| e.id > last_id));
    }

    #[tokio::test]
    async fn live_tail_picks_up_new_events() {
        let store = memory_store().await;
        let job_id = seeded_job(&store, 1).await;

        let tail_store = store.clone();
        let tail_job = job_id.clone();
        let collector = tokio::spawn(async move {
            event_stream(tail_store, tail_job, 0, Duration::from_millis(10))
                .collect::<Vec<JobEventRow>>()
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .append_job_event(
                &job_id,
                &ResearchEvent::Status {
                    status: JobStatus::Succeeded,
                    message: None,
                },
            )
            .await
            .unwrap();
        store
            .set_job_status(&job_id, JobStatus::Succeeded, None, true)
            .await
            .unwrap();

        let events = collector.await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().event_type, "status");
    }
}
