use anyhow::Result;
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        error::{
            BasicError,
            InteractionError,
        },
        id::Id,
        roles::RouterRole,
        types::{
            Dictionary,
            HashMap,
            HashSet,
        },
        uri::Uri,
    },
    message::message::{
        EventMessage,
        Message,
        PublishMessage,
    },
    router::context::RealmContext,
};

/// Options for publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Should the publisher receive a PUBLISHED confirmation?
    pub acknowledge: bool,
    /// Should the publisher be excluded from receiving the event?
    pub exclude_me: bool,
}

impl From<&Dictionary> for PublishOptions {
    fn from(options: &Dictionary) -> Self {
        Self {
            acknowledge: options
                .get("acknowledge")
                .and_then(|value| value.bool())
                .unwrap_or(false),
            exclude_me: options
                .get("exclude_me")
                .and_then(|value| value.bool())
                .unwrap_or(true),
        }
    }
}

/// A standing interest by one or more sessions in a topic.
///
/// There is at most one subscription per topic in a realm; every subscriber
/// shares its ID.
pub struct Subscription {
    pub id: Id,
    pub topic: Uri,
    pub subscribers: HashSet<Id>,
}

/// The broker state of a realm: all topics and their subscribers.
///
/// The same subscription is indexed by topic (for PUBLISH), by subscription
/// ID (for UNSUBSCRIBE), and by session (for detach cleanup). The indexes
/// share entry lifetimes.
#[derive(Default)]
pub struct TopicManager {
    subscriptions: HashMap<Id, Subscription>,
    subscriptions_by_topic: HashMap<Uri, Id>,
    subscriptions_by_session: HashMap<Id, HashSet<Id>>,
}

impl TopicManager {
    /// The subscription for a topic, if any session subscribes to it.
    pub fn subscription(&self, topic: &Uri) -> Option<&Subscription> {
        self.subscriptions_by_topic
            .get(topic)
            .and_then(|id| self.subscriptions.get(id))
    }

    /// Subscribes a session to a topic.
    ///
    /// Subscribing is idempotent: the first SUBSCRIBE for a topic mints the
    /// subscription, and every later SUBSCRIBE (from any session) returns the
    /// same subscription ID.
    pub async fn subscribe(
        context: &mut RealmContext<'_>,
        session: Id,
        topic: Uri,
    ) -> Result<Id> {
        if !context.router().config.roles.contains(&RouterRole::Broker) {
            return Err(BasicError::NotAllowed("router is not a broker".to_owned()).into());
        }
        topic
            .validate()
            .map_err(|_| InteractionError::InvalidUri)?;

        let subscription_id = context
            .realm()
            .topic_manager
            .subscriptions_by_topic
            .get(&topic)
            .copied();
        let subscription_id = match subscription_id {
            Some(subscription_id) => subscription_id,
            None => {
                let subscription_id = context.router().router_id_allocator.generate_id().await?;
                let manager = &mut context.realm_mut().topic_manager;
                manager.subscriptions.insert(
                    subscription_id,
                    Subscription {
                        id: subscription_id,
                        topic: topic.clone(),
                        subscribers: HashSet::default(),
                    },
                );
                manager
                    .subscriptions_by_topic
                    .insert(topic.clone(), subscription_id);
                subscription_id
            }
        };

        let manager = &mut context.realm_mut().topic_manager;
        if let Some(subscription) = manager.subscriptions.get_mut(&subscription_id) {
            subscription.subscribers.insert(session);
        }
        manager
            .subscriptions_by_session
            .entry(session)
            .or_default()
            .insert(subscription_id);
        Ok(subscription_id)
    }

    /// Removes a session from a subscription, pruning the subscription when
    /// its last subscriber leaves.
    pub async fn unsubscribe(
        context: &mut RealmContext<'_>,
        session: Id,
        subscription_id: Id,
    ) -> Result<()> {
        let manager = &mut context.realm_mut().topic_manager;
        let subscription = manager
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or(InteractionError::NoSuchSubscription)?;
        if !subscription.subscribers.remove(&session) {
            return Err(InteractionError::NoSuchSubscription.into());
        }

        if let Some(subscription_ids) = manager.subscriptions_by_session.get_mut(&session) {
            subscription_ids.remove(&subscription_id);
            if subscription_ids.is_empty() {
                manager.subscriptions_by_session.remove(&session);
            }
        }

        if subscription.subscribers.is_empty() {
            let topic = subscription.topic.clone();
            manager.subscriptions.remove(&subscription_id);
            manager.subscriptions_by_topic.remove(&topic);
        }
        Ok(())
    }

    /// Publishes an event to a topic, fanning it out to the subscriber set
    /// snapshotted at publish time.
    ///
    /// Returns the freshly-allocated publication ID.
    pub async fn publish(
        context: &mut RealmContext<'_>,
        session: Id,
        message: &PublishMessage,
        options: &PublishOptions,
    ) -> Result<Id> {
        if !context.router().config.roles.contains(&RouterRole::Broker) {
            return Err(BasicError::NotAllowed("router is not a broker".to_owned()).into());
        }
        message
            .topic
            .validate()
            .map_err(|_| InteractionError::InvalidUri)?;

        let publication_id = context.router().id_allocator.generate_id().await?;
        let subscription = match context.realm().topic_manager.subscription(&message.topic) {
            Some(subscription) => subscription,
            None => return Ok(publication_id),
        };

        let subscription_id = subscription.id;
        let subscribers = subscription
            .subscribers
            .iter()
            .filter(|subscriber| !(options.exclude_me && **subscriber == session))
            .cloned()
            .collect::<Vec<_>>();
        for subscriber in subscribers {
            let subscriber_session = match context.session(subscriber) {
                Some(subscriber_session) => &subscriber_session.session,
                None => continue,
            };
            if let Err(err) = subscriber_session.send_message(Message::Event(EventMessage {
                subscribed_subscription: subscription_id,
                published_publication: publication_id,
                details: Dictionary::default(),
                publish_arguments: message.arguments.clone(),
                publish_arguments_keyword: message.arguments_keyword.clone(),
            })) {
                // Events are fire-and-forget: a congested or closing
                // subscriber misses the event rather than stalling the
                // publisher.
                warn!("Dropping EVENT (publication {publication_id}) for session {subscriber}: {err}");
            }
        }
        Ok(publication_id)
    }

    /// Removes every subscription held by a detached session.
    pub async fn detach_session(context: &mut RealmContext<'_>, session: Id) {
        let manager = &mut context.realm_mut().topic_manager;
        let subscription_ids = match manager.subscriptions_by_session.remove(&session) {
            Some(subscription_ids) => subscription_ids,
            None => return,
        };
        for subscription_id in subscription_ids {
            let subscription = match manager.subscriptions.get_mut(&subscription_id) {
                Some(subscription) => subscription,
                None => continue,
            };
            subscription.subscribers.remove(&session);
            if subscription.subscribers.is_empty() {
                let topic = subscription.topic.clone();
                manager.subscriptions.remove(&subscription_id);
                manager.subscriptions_by_topic.remove(&topic);
            }
        }
        debug!("Removed all subscriptions for session {session}");
    }
}
