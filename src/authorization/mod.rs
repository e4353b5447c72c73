// Authorization (IS-10)
// Server discovery, client registration, token grants and refresh, and
// access token validation

pub mod behaviour;
pub mod client;
pub mod keys;
pub mod persistence;
pub mod pkce;
pub mod state;
pub mod validation;

pub use behaviour::{
    authorization_behaviour_task, token_issuer_helper_task, AuthorizationBehaviour,
    OpenBrowserHandler,
};
pub use keys::SigningKeys;
pub use state::{AuthorizationState, BearerToken, SharedAuthorizationState};
pub use validation::{validate_access_token, Access, TokenValidation};

/// The API scopes defined by IS-10.
pub mod scopes {
    pub const REGISTRATION: &str = "registration";
    pub const QUERY: &str = "query";
    pub const NODE: &str = "node";
    pub const CONNECTION: &str = "connection";
    pub const EVENTS: &str = "events";
    pub const CHANNELMAPPING: &str = "channelmapping";

    pub const ALL: &[&str] = &[REGISTRATION, QUERY, NODE, CONNECTION, EVENTS, CHANNELMAPPING];
}

/// Flag an unknown token issuer for the helper task and wake it.
///
/// Called by resource servers whose token validation returned
/// `NoMatchingKeys`; a client retrying with the same token succeeds once the
/// helper has populated the cache.
pub async fn request_token_issuer_keys(
    model: &crate::model::NodeModel,
    auth_state: &SharedAuthorizationState,
    issuer: &str,
) {
    {
        let mut state = auth_state.write().await;
        state.fetch_token_issuer_pubkeys = Some(issuer.to_string());
    }
    model.notify();
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeModel;
    use crate::settings::Settings;

    #[tokio::test]
    async fn test_request_token_issuer_keys_sets_flag_and_notifies() {
        let model = NodeModel::new(Settings::default());
        let auth_state = AuthorizationState::new();
        let mut updates = model.watch_updates();

        request_token_issuer_keys(&model, &auth_state, "https://other.example/").await;

        assert_eq!(
            auth_state.read().await.fetch_token_issuer_pubkeys.as_deref(),
            Some("https://other.example/")
        );
        // the helper task's wait predicate re-checks on this notification
        assert!(updates.has_changed().unwrap());
    }

    #[test]
    fn test_scope_list() {
        assert!(scopes::ALL.contains(&scopes::REGISTRATION));
        assert!(scopes::ALL.contains(&scopes::CHANNELMAPPING));
    }
}
