use std::time::Duration;

use anyhow::Result;
use test_utils::client::WebSocketClient;
use wamphub::{
    core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        Message,
        PublishMessage,
        SubscribeMessage,
        UnsubscribeMessage,
    },
    router::{
        ListenerConfig,
        RealmConfig,
        Router,
        RouterConfig,
        RouterHandle,
        TransportKind,
    },
    serializer::serializer::SerializerType,
};

const REALM: &str = "com.wamphub.test";

async fn start_router() -> Result<RouterHandle> {
    test_utils::setup::setup_test_environment();
    let mut config = RouterConfig::default();
    config
        .realms
        .push(RealmConfig::new("test", Uri::try_from(REALM)?));
    config
        .listeners
        .push(ListenerConfig::local(TransportKind::WebSocket));
    Router::new(config)?.start().await
}

async fn connect(router_handle: &RouterHandle) -> WebSocketClient {
    WebSocketClient::connect(
        router_handle.local_addr(TransportKind::WebSocket).unwrap(),
        SerializerType::Json,
    )
    .await
    .unwrap()
}

fn subscribe(request: u64, topic: &str) -> Message {
    Message::Subscribe(SubscribeMessage {
        request: Id::try_from(request).unwrap(),
        options: Dictionary::default(),
        topic: Uri::try_from(topic).unwrap(),
    })
}

fn publish(request: u64, topic: &str, arguments: List, options: Dictionary) -> Message {
    Message::Publish(PublishMessage {
        request: Id::try_from(request).unwrap(),
        options,
        topic: Uri::try_from(topic).unwrap(),
        arguments,
        arguments_keyword: Dictionary::default(),
    })
}

fn acknowledge() -> Dictionary {
    Dictionary::from_iter([("acknowledge".to_owned(), Value::Bool(true))])
}

#[tokio::test]
async fn subscriber_receives_published_event() {
    let router_handle = start_router().await.unwrap();
    let mut subscriber = connect(&router_handle).await;
    let mut publisher = connect(&router_handle).await;
    subscriber.join_realm(REALM).await.unwrap();
    publisher.join_realm(REALM).await.unwrap();

    subscriber
        .send(&subscribe(1, "com.wamphub.topic1"))
        .await
        .unwrap();
    let subscription = assert_matches::assert_matches!(
        subscriber.recv().await,
        Ok(Message::Subscribed(message)) => {
            assert_eq!(message.subscribe_request, Id::try_from(1).unwrap());
            message.subscription
        }
    );

    publisher
        .send(&publish(
            7,
            "com.wamphub.topic1",
            List::from_iter([Value::String("hi".to_owned())]),
            acknowledge(),
        ))
        .await
        .unwrap();
    let publication = assert_matches::assert_matches!(
        publisher.recv().await,
        Ok(Message::Published(message)) => {
            assert_eq!(message.publish_request, Id::try_from(7).unwrap());
            message.publication
        }
    );

    assert_matches::assert_matches!(subscriber.recv().await, Ok(Message::Event(message)) => {
        assert_eq!(message.subscribed_subscription, subscription);
        assert_eq!(message.published_publication, publication);
        pretty_assertions::assert_eq!(
            message.publish_arguments,
            List::from_iter([Value::String("hi".to_owned())])
        );
        assert!(message.publish_arguments_keyword.is_empty());
    });
}

#[tokio::test]
async fn publisher_excluded_from_own_events_by_default() {
    let router_handle = start_router().await.unwrap();
    let mut client = connect(&router_handle).await;
    client.join_realm(REALM).await.unwrap();

    client.send(&subscribe(1, "com.wamphub.topic1")).await.unwrap();
    assert_matches::assert_matches!(client.recv().await, Ok(Message::Subscribed(_)));

    client
        .send(&publish(2, "com.wamphub.topic1", List::default(), acknowledge()))
        .await
        .unwrap();
    assert_matches::assert_matches!(client.recv().await, Ok(Message::Published(_)));

    // No EVENT for the publisher itself.
    assert_matches::assert_matches!(
        tokio::time::timeout(Duration::from_millis(300), client.recv()).await,
        Err(_)
    );

    // Unless exclusion is turned off explicitly.
    let mut options = acknowledge();
    options.insert("exclude_me".to_owned(), Value::Bool(false));
    client
        .send(&publish(3, "com.wamphub.topic1", List::default(), options))
        .await
        .unwrap();
    let mut saw_published = false;
    let mut saw_event = false;
    for _ in 0..2 {
        match client.recv().await.unwrap() {
            Message::Published(_) => saw_published = true,
            Message::Event(_) => saw_event = true,
            message => panic!("unexpected message: {message:?}"),
        }
    }
    assert!(saw_published);
    assert!(saw_event);
}

#[tokio::test]
async fn duplicate_subscribe_reuses_subscription_id() {
    let router_handle = start_router().await.unwrap();
    let mut client = connect(&router_handle).await;
    client.join_realm(REALM).await.unwrap();

    client.send(&subscribe(1, "com.wamphub.topic1")).await.unwrap();
    let first = assert_matches::assert_matches!(
        client.recv().await,
        Ok(Message::Subscribed(message)) => message.subscription
    );
    client.send(&subscribe(2, "com.wamphub.topic1")).await.unwrap();
    let second = assert_matches::assert_matches!(
        client.recv().await,
        Ok(Message::Subscribed(message)) => message.subscription
    );
    assert_eq!(first, second);
}

#[tokio::test]
async fn unsubscribed_session_stops_receiving_events() {
    let router_handle = start_router().await.unwrap();
    let mut subscriber = connect(&router_handle).await;
    let mut publisher = connect(&router_handle).await;
    subscriber.join_realm(REALM).await.unwrap();
    publisher.join_realm(REALM).await.unwrap();

    subscriber
        .send(&subscribe(1, "com.wamphub.topic1"))
        .await
        .unwrap();
    let subscription = assert_matches::assert_matches!(
        subscriber.recv().await,
        Ok(Message::Subscribed(message)) => message.subscription
    );

    subscriber
        .send(&Message::Unsubscribe(UnsubscribeMessage {
            request: Id::try_from(2).unwrap(),
            subscribed_subscription: subscription,
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(subscriber.recv().await, Ok(Message::Unsubscribed(message)) => {
        assert_eq!(message.unsubscribe_request, Id::try_from(2).unwrap());
    });

    publisher
        .send(&publish(3, "com.wamphub.topic1", List::default(), acknowledge()))
        .await
        .unwrap();
    assert_matches::assert_matches!(publisher.recv().await, Ok(Message::Published(_)));

    assert_matches::assert_matches!(
        tokio::time::timeout(Duration::from_millis(300), subscriber.recv()).await,
        Err(_)
    );
}

#[tokio::test]
async fn unsubscribe_with_unknown_subscription_fails() {
    let router_handle = start_router().await.unwrap();
    let mut client = connect(&router_handle).await;
    client.join_realm(REALM).await.unwrap();

    client
        .send(&Message::Unsubscribe(UnsubscribeMessage {
            request: Id::try_from(1).unwrap(),
            subscribed_subscription: Id::try_from(123456).unwrap(),
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(client.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request, Id::try_from(1).unwrap());
        assert_eq!(message.error.as_ref(), "wamp.error.no_such_subscription");
    });
}

#[tokio::test]
async fn subscribe_with_invalid_topic_fails() {
    let router_handle = start_router().await.unwrap();
    let mut client = connect(&router_handle).await;
    client.join_realm(REALM).await.unwrap();

    client
        .send(&Message::Subscribe(SubscribeMessage {
            request: Id::try_from(1).unwrap(),
            options: Dictionary::default(),
            topic: serde_json::from_str::<Uri>(r#""com..broken""#).unwrap(),
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(client.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request, Id::try_from(1).unwrap());
        assert_eq!(message.error.as_ref(), "wamp.error.invalid_uri");
    });
}

#[tokio::test]
async fn disconnected_subscriber_is_pruned() {
    let router_handle = start_router().await.unwrap();
    let mut subscriber = connect(&router_handle).await;
    let mut publisher = connect(&router_handle).await;
    subscriber.join_realm(REALM).await.unwrap();
    publisher.join_realm(REALM).await.unwrap();

    subscriber
        .send(&subscribe(1, "com.wamphub.topic1"))
        .await
        .unwrap();
    assert_matches::assert_matches!(subscriber.recv().await, Ok(Message::Subscribed(_)));
    subscriber.close().await.unwrap();
    drop(subscriber);

    // Give the router a moment to notice the disconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher
        .send(&publish(2, "com.wamphub.topic1", List::default(), acknowledge()))
        .await
        .unwrap();
    assert_matches::assert_matches!(publisher.recv().await, Ok(Message::Published(_)));
}
