use pubsub::InProcessBroker;
use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) broker: InProcessBroker,
    pub(crate) transport_capacity: usize,
}
