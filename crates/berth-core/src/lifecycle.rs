use crate::CoreError;
use berth_store::ServiceStatus;

/// Reject any status change not in the service lifecycle table.
pub fn validate_transition(from: ServiceStatus, to: ServiceStatus) -> Result<(), CoreError> {
    use ServiceStatus::{
        Builderror, Deleted, Deleting, Empty, Error, Inaccessible, InstallPending, Installing,
        Paused, Preparing, Reverting, Running, Undefined, UpdatePending, Updating,
    };

    let valid = matches!(
        (from, to),
        (Empty, Preparing)
            | (Preparing, InstallPending)
            | (InstallPending, Installing)
            | (Installing, InstallPending | Paused | Running)
            | (
                Paused | Running | Builderror | Error | Inaccessible | Undefined,
                Running | Paused | UpdatePending | Reverting | Installing
            )
            | (UpdatePending, Updating)
            | (Updating, UpdatePending | Running)
            | (Reverting, Running)
            | (Deleting, Deleted)
            | (Installing | Updating, Builderror)
    ) || (to == Deleting && !matches!(from, Deleting | Deleted))
        || (matches!(to, Error | Inaccessible | Undefined) && from != Deleted);

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
