use crate::observer::{Observer, payload_to_value};

use codec::client::SearchStart;
use routing::{
    EXTREME_PRIORITY,
    engine::{Engine, Error, GetOutcome},
    lookup::{LookupJob, LookupWorker},
    manager::{ClientId, QueryManager, ResponseSink},
};

/// Process a search request from a local client.
///
/// The query is tracked first so nothing delivered from now on is lost.
/// A synchronous fast-path probe then checks whether the unique answer is
/// already local, short-circuiting the network entirely; otherwise the
/// (potentially slow) full local lookup is queued for the background
/// worker and the query goes to the routing engine.
pub fn start_search<T>(
    engine: &Engine,
    manager: &QueryManager<T>,
    observer: &Observer<T>,
    lookup: &LookupWorker,
    client: ClientId,
    request: &SearchStart,
) -> Result<GetOutcome, Error>
where
    T: ResponseSink + 'static,
{
    let Some(primary) = request.keys.first() else {
        return Err(Error::Malformed(codec::Error::UnderLength));
    };

    manager.track(primary, request.block_type, client);

    // Fast path: only the first local match, just enough to establish
    // whether the search is already over.
    let mut done = false;
    use routing::Blockstore;
    observer.get(
        request.block_type,
        EXTREME_PRIORITY,
        &request.keys,
        &mut |key, payload| {
            if let Some(value) = payload_to_value(payload) {
                manager.process_response(key, &value);
                if observer.is_unique_reply(payload, request.block_type, key) {
                    done = true;
                }
            }

            false
        },
    );

    if done {
        log::debug!("search for {:?} answered from the local store", primary);
        return Ok(GetOutcome::Local);
    }

    // The full local lookup may take a while due to IO; keep it off the
    // caller's path.
    lookup.queue(LookupJob {
        block_type: request.block_type,
        keys: request.keys.clone(),
    });

    engine.get_start(
        request.target(),
        request.block_type,
        request.anonymity,
        &request.keys,
        request.expiration,
        request.priority,
    )
}

/// Stop a search early: stop tracking and stop transmitting.
pub fn stop_search<T>(
    engine: &Engine,
    manager: &QueryManager<T>,
    client: ClientId,
    key: &codec::Key,
) where
    T: ResponseSink,
{
    engine.get_stop(std::slice::from_ref(key));
    manager.untrack(key, client);
}
