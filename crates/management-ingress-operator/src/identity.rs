//! Lookup of the identity provider settings the ingress needs to validate tokens.
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::client::{Client, StoreError};

pub const AUTH_IDP_CONFIGMAP_NAME: &str = "platform-auth-idp";
pub const OIDC_CREDENTIALS_SECRET_NAME: &str = "platform-oidc-credentials";
pub const OIDC_ISSUER_URL_KEY: &str = "OIDC_ISSUER_URL";
pub const CLIENT_ID_KEY: &str = "WLP_CLIENT_ID";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get configmap {AUTH_IDP_CONFIGMAP_NAME:?} in namespace {namespace:?}"))]
    GetAuthIdpConfigMap {
        source: StoreError,
        namespace: String,
    },

    #[snafu(display(
        "failed to get secret {OIDC_CREDENTIALS_SECRET_NAME:?} in namespace {namespace:?}"
    ))]
    GetOidcCredentialsSecret {
        source: StoreError,
        namespace: String,
    },
}

/// The two values the ingress gets from the identity provider configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityInputs {
    pub oidc_issuer_url: String,
    pub oauth_client_id: String,
}

/// Reads the OIDC issuer URL and the OAuth client id from `iam_namespace`.
///
/// Missing objects are errors, missing keys result in empty values.
pub async fn fetch_identity_inputs(client: &Client, iam_namespace: &str) -> Result<IdentityInputs> {
    let auth_configmap: ConfigMap = client
        .get(AUTH_IDP_CONFIGMAP_NAME, iam_namespace)
        .await
        .context(GetAuthIdpConfigMapSnafu {
            namespace: iam_namespace,
        })?;
    let credentials_secret: Secret = client
        .get(OIDC_CREDENTIALS_SECRET_NAME, iam_namespace)
        .await
        .context(GetOidcCredentialsSecretSnafu {
            namespace: iam_namespace,
        })?;

    let inputs = identity_inputs_from(&auth_configmap, &credentials_secret);
    debug!(
        oidc.issuer_url = %inputs.oidc_issuer_url,
        "Fetched identity provider settings"
    );
    Ok(inputs)
}

fn identity_inputs_from(auth_configmap: &ConfigMap, credentials_secret: &Secret) -> IdentityInputs {
    let oidc_issuer_url = auth_configmap
        .data
        .as_ref()
        .and_then(|data| data.get(OIDC_ISSUER_URL_KEY))
        .cloned()
        .unwrap_or_default();
    let oauth_client_id = credentials_secret
        .data
        .as_ref()
        .and_then(|data| data.get(CLIENT_ID_KEY))
        .map(|value| String::from_utf8_lossy(&value.0).into_owned())
        .unwrap_or_default();

    IdentityInputs {
        oidc_issuer_url,
        oauth_client_id,
    }
}
