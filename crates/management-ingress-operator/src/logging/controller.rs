//! Facilities for reporting Kubernetes controller outcomes
//!
//! The primary entry point is [`report_controller_reconciled`].
use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and
    /// [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// A reference to a secondary object providing additional context, if any
    ///
    /// This should be [`Some`] if the error happens while evaluating some related object
    /// (for example: when writing the [`Deployment`] owned by the controller object).
    ///
    /// [`Deployment`]: `k8s_openapi::api::apps::v1::Deployment`
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Reports the controller reconciliation result to the current [`tracing::Subscriber`]
///
/// Errors relevant to the end user are published as Kubernetes events where they happen, so
/// this only has to take care of the operator administrator.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(controller::Error::ReconcilerFailed(error, obj)) => {
            tracing::error!(
                controller.name = controller_name,
                object = %obj,
                error.category = error.category(),
                secondary_object = ?error.secondary_object(),
                error = error as &dyn Error,
                "Failed to reconcile object",
            );
        }
        Err(error) => {
            tracing::error!(
                controller.name = controller_name,
                error = &*error as &dyn Error,
                "Controller failed",
            );
        }
    }
}
