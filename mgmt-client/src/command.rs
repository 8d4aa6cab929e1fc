//! Running commands with the configured retry policy

use crate::seq::SeqAllocator;
use mgmt_codec::NmpMsg;
use mgmt_core::{MgmtResult, TxOptions};
use mgmt_session::Session;

/// Send a request, retrying on timeout
///
/// Makes up to `opts.tries` single-attempt transmits. Only a transmit
/// timeout is retried; any other error is returned at once. Every attempt
/// gets a fresh sequence number, so a late response to an earlier attempt
/// can never complete a later one.
///
/// # Arguments
///
/// * `session` - Open session to send on
/// * `seqs` - Sequence number source for this session
/// * `opts` - Per-call timeout and number of tries
/// * `build` - Builds the request for a given sequence number
pub async fn run_with_retries<S, F>(
    session: &S,
    seqs: &SeqAllocator,
    opts: TxOptions,
    mut build: F,
) -> MgmtResult<NmpMsg>
where
    S: Session + ?Sized,
    F: FnMut(u8) -> MgmtResult<NmpMsg>,
{
    let tries = opts.tries.max(1);
    let mut attempt = 1;
    loop {
        let req = build(seqs.next_seq())?;
        match session.transmit_once(&req, opts).await {
            Err(e) if e.is_timeout() && attempt < tries => {
                log::debug!(
                    "Request seq {} timed out (attempt {}/{}), retrying",
                    req.seq(),
                    attempt,
                    tries
                );
                attempt += 1;
            }
            result => return result,
        }
    }
}
