use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    CustomResourceExt,
    runtime::{Controller, watcher},
};
use management_ingress_operator::{
    cli::Command,
    client::Client,
    controller::{self, CONTROLLER_NAME, Ctx},
    crd::ManagementIngress,
    logging::{self, controller::report_controller_reconciled},
};
use snafu::{ResultExt, Snafu};

const OPERATOR_NAME: &str = "management-ingress-operator";
const LOG_ENV: &str = "MANAGEMENT_INGRESS_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to serialize CRD"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("invalid rollout wait options"))]
    InvalidRolloutWaitOptions {
        source: management_ingress_operator::deployment::rollout::InvalidWaitOptions,
    },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    match Command::parse() {
        Command::Crd => {
            print!(
                "{}",
                serde_yaml::to_string(&ManagementIngress::crd()).context(SerializeCrdSnafu)?
            );
        }
        Command::Run(args) => {
            logging::initialize_logging(LOG_ENV, OPERATOR_NAME, args.log_format)
                .context(InitializeLoggingSnafu)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                watch_namespace = ?args.watch_namespace,
                "Starting {OPERATOR_NAME}"
            );

            let rollout_wait = args
                .rollout_wait_options()
                .context(InvalidRolloutWaitOptionsSnafu)?;
            let client = Client::new(
                kube::Client::try_default().await.context(CreateClientSnafu)?,
                Some(OPERATOR_NAME.to_string()),
            );

            Controller::new(
                args.watch_namespace.get_api::<ManagementIngress>(&client),
                watcher::Config::default(),
            )
            .owns(
                args.watch_namespace.get_api::<Deployment>(&client),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .run(
                controller::reconcile,
                controller::error_policy,
                Arc::new(Ctx {
                    client,
                    rollout_wait,
                }),
            )
            .for_each(|result| async move {
                report_controller_reconciled(CONTROLLER_NAME, &result);
            })
            .await;
        }
    }

    Ok(())
}
