// Async driver: feeds bars through the engine and runs backfills off-thread
use super::{Engine, EngineEvent};
use crate::backfill::{spawn_backfill, HistoricalSource};
use crate::execution::OrderGateway;
use crate::models::Bar;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Drive `engine` with a recorded feed
///
/// Backfills run as spawned tasks and never hold up the feed; a finished
/// fetch is dispatched ahead of the next bar. A fetch that does not answer
/// is left to the stream's own timeout. Once the feed is exhausted the
/// engine is walked to the latest session cutoff.
pub async fn run_feed<G: OrderGateway>(
    engine: &mut Engine<G>,
    feed: Vec<Bar>,
    history: Arc<dyn HistoricalSource>,
) {
    let timeout = engine
        .backfill_timeout
        .to_std()
        .unwrap_or(Duration::from_secs(30));
    let (tx, mut rx) = mpsc::channel::<EngineEvent>(64);
    let mut feed = feed.into_iter();

    loop {
        // Give spawned fetches a chance to post before the next bar
        tokio::task::yield_now().await;

        let event = tokio::select! {
            biased;
            Some(event) = rx.recv() => event,
            next = async { feed.next() } => match next {
                Some(bar) => EngineEvent::Bar(bar),
                None => break,
            },
        };
        dispatch(engine, event, &history, timeout, &tx);
    }

    while let Ok(event) = rx.try_recv() {
        dispatch(engine, event, &history, timeout, &tx);
    }

    if !engine.all_complete() {
        if let Some(end) = engine.streams().map(|s| s.times().cutoff.utc).max() {
            tracing::info!(at = %end, "Feed exhausted, advancing to session end");
            engine.handle(EngineEvent::Heartbeat(end));
        }
    }
}

fn dispatch<G: OrderGateway>(
    engine: &mut Engine<G>,
    event: EngineEvent,
    history: &Arc<dyn HistoricalSource>,
    timeout: Duration,
    tx: &mpsc::Sender<EngineEvent>,
) {
    engine.handle(event);
    for request in engine.take_backfill_requests() {
        spawn_backfill(history.clone(), request, timeout, tx.clone());
    }
}
