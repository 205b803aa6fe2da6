//! Atomic transfer of one file's lock state between authorities.
//!
//! The protocol is registry-brokered: mark transferring (nobody serves),
//! export from the source, import at the target, commit at the next
//! epoch. A failed import does not fall back to the exported source,
//! since that path could leave two live copies; it poisons the file on
//! both ends and surfaces the error.

use std::sync::Arc;

use shepherd_error::{LockError, Result};
use shepherd_observability::LockEvent;
use shepherd_types::{AuthorityEpoch, FileId};

use crate::instance::AuthorityInstance;

/// Move the authority for `file` from `from` to `to`.
///
/// Holders and queued waiters move as one unit: holders are identical on
/// the new authority, and waiters keep their queue positions (their
/// suspended callers are woken to re-route and bind to the preserved
/// positions). Returns the new placement epoch.
pub fn transfer_authority(
    file: FileId,
    from: &AuthorityInstance,
    to: &AuthorityInstance,
) -> Result<AuthorityEpoch> {
    if !Arc::ptr_eq(from.registry(), to.registry()) {
        return Err(LockError::invalid_argument(
            "instances belong to different registries",
        ));
    }
    let registry = from.registry();
    registry.begin_transfer(file, from.node(), to.node())?;
    from.table().observer().on_event(&LockEvent::HandoffStarted {
        file,
        from: from.node(),
        to: to.node(),
    });

    let snapshot = match from.table().export_file(file) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            // Nothing left the source; the transfer simply never happened.
            registry.abort_transfer(file)?;
            return Err(err);
        }
    };
    from.forget_epoch(file);

    if let Err(err) = to.table().import_file(file, &snapshot) {
        // The source already evicted its copy and the target refused the
        // import; neither side can be trusted to serve the file again.
        tracing::error!(%file, %err, "authority import failed; poisoning both ends");
        let poison = LockError::SplitBrain { file: file.get() };
        from.table().fail_file(file, poison.clone());
        to.table().fail_file(file, poison);
        registry.abort_transfer(file)?;
        return Err(err);
    }

    let epoch = registry.commit_transfer(file)?;
    to.record_epoch(file, epoch);
    to.table().observer().on_event(&LockEvent::HandoffCompleted {
        file,
        to: to.node(),
        epoch: epoch.get(),
    });
    tracing::info!(%file, from = %from.node(), to = %to.node(), %epoch, "authority handoff complete");
    Ok(epoch)
}
