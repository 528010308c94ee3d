mod acceptor;
mod connection;
mod context;
mod procedure;
mod realm;
mod router;
mod session;
mod topic;

pub use context::{
    RealmContext,
    RouterContext,
};
pub use procedure::{
    PendingInvocation,
    Procedure,
    ProcedureManager,
};
pub use realm::{
    Realm,
    RealmConfig,
    RealmManager,
    RealmSession,
};
pub use router::{
    ListenerConfig,
    Router,
    RouterConfig,
    RouterHandle,
    TransportKind,
    DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_OUTBOUND_HIGH_WATER_MARK,
};
pub use session::{
    SessionHandle,
    SessionWriteError,
};
pub use topic::{
    PublishOptions,
    Subscription,
    TopicManager,
};
