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
        CallMessage,
        ErrorMessage,
        Message,
        RegisterMessage,
        UnregisterMessage,
        YieldMessage,
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

fn register(request: u64, procedure: &str) -> Message {
    Message::Register(RegisterMessage {
        request: Id::try_from(request).unwrap(),
        options: Dictionary::default(),
        procedure: Uri::try_from(procedure).unwrap(),
    })
}

fn call(request: u64, procedure: &str, arguments: List) -> Message {
    Message::Call(CallMessage {
        request: Id::try_from(request).unwrap(),
        options: Dictionary::default(),
        procedure: Uri::try_from(procedure).unwrap(),
        arguments,
        arguments_keyword: Dictionary::default(),
    })
}

async fn register_ok(client: &mut WebSocketClient, request: u64, procedure: &str) -> Id {
    client.send(&register(request, procedure)).await.unwrap();
    assert_matches::assert_matches!(client.recv().await, Ok(Message::Registered(message)) => {
        assert_eq!(message.register_request, Id::try_from(request).unwrap());
        message.registration
    })
}

#[tokio::test]
async fn register_call_yield_result() {
    let router_handle = start_router().await.unwrap();
    let mut callee = connect(&router_handle).await;
    let mut caller = connect(&router_handle).await;
    callee.join_realm(REALM).await.unwrap();
    caller.join_realm(REALM).await.unwrap();

    let registration = register_ok(&mut callee, 1, "com.wamphub.add").await;

    caller
        .send(&call(
            9,
            "com.wamphub.add",
            List::from_iter([Value::Integer(2), Value::Integer(3)]),
        ))
        .await
        .unwrap();

    let invocation = assert_matches::assert_matches!(
        callee.recv().await,
        Ok(Message::Invocation(message)) => {
            assert_eq!(message.registered_registration, registration);
            pretty_assertions::assert_eq!(
                message.call_arguments,
                List::from_iter([Value::Integer(2), Value::Integer(3)])
            );
            message.request
        }
    );

    callee
        .send(&Message::Yield(YieldMessage {
            invocation_request: invocation,
            options: Dictionary::default(),
            arguments: List::from_iter([Value::Integer(5)]),
            arguments_keyword: Dictionary::default(),
        }))
        .await
        .unwrap();

    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Result(message)) => {
        assert_eq!(message.call_request, Id::try_from(9).unwrap());
        pretty_assertions::assert_eq!(message.yield_arguments, List::from_iter([Value::Integer(5)]));
    });
}

#[tokio::test]
async fn call_with_no_procedure_fails() {
    let router_handle = start_router().await.unwrap();
    let mut caller = connect(&router_handle).await;
    caller.join_realm(REALM).await.unwrap();

    caller
        .send(&call(9, "com.wamphub.missing", List::default()))
        .await
        .unwrap();
    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request_type, 48);
        assert_eq!(message.request, Id::try_from(9).unwrap());
        assert_eq!(message.error.as_ref(), "wamp.error.no_such_procedure");
    });
}

#[tokio::test]
async fn duplicate_registration_fails() {
    let router_handle = start_router().await.unwrap();
    let mut first = connect(&router_handle).await;
    let mut second = connect(&router_handle).await;
    first.join_realm(REALM).await.unwrap();
    second.join_realm(REALM).await.unwrap();

    register_ok(&mut first, 1, "com.wamphub.svc").await;

    second.send(&register(2, "com.wamphub.svc")).await.unwrap();
    assert_matches::assert_matches!(second.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request, Id::try_from(2).unwrap());
        assert_eq!(message.error.as_ref(), "wamp.error.procedure_already_exists");
    });
}

#[tokio::test]
async fn callee_disconnect_cancels_pending_call() {
    let router_handle = start_router().await.unwrap();
    let mut callee = connect(&router_handle).await;
    let mut caller = connect(&router_handle).await;
    callee.join_realm(REALM).await.unwrap();
    caller.join_realm(REALM).await.unwrap();

    register_ok(&mut callee, 1, "com.wamphub.slow").await;

    caller
        .send(&call(77, "com.wamphub.slow", List::default()))
        .await
        .unwrap();
    assert_matches::assert_matches!(callee.recv().await, Ok(Message::Invocation(_)));

    // The callee vanishes before yielding.
    callee.close().await.unwrap();
    drop(callee);

    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request_type, 48);
        assert_eq!(message.request, Id::try_from(77).unwrap());
        assert_eq!(message.error.as_ref(), "wamp.error.canceled");
    });

    // The registration is gone with the callee.
    caller
        .send(&call(78, "com.wamphub.slow", List::default()))
        .await
        .unwrap();
    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.error.as_ref(), "wamp.error.no_such_procedure");
    });
}

#[tokio::test]
async fn unregistered_procedure_is_not_callable() {
    let router_handle = start_router().await.unwrap();
    let mut callee = connect(&router_handle).await;
    let mut caller = connect(&router_handle).await;
    callee.join_realm(REALM).await.unwrap();
    caller.join_realm(REALM).await.unwrap();

    let registration = register_ok(&mut callee, 1, "com.wamphub.svc").await;

    callee
        .send(&Message::Unregister(UnregisterMessage {
            request: Id::try_from(2).unwrap(),
            registered_registration: registration,
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(callee.recv().await, Ok(Message::Unregistered(message)) => {
        assert_eq!(message.unregister_request, Id::try_from(2).unwrap());
    });

    caller
        .send(&call(9, "com.wamphub.svc", List::default()))
        .await
        .unwrap();
    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.error.as_ref(), "wamp.error.no_such_procedure");
    });
}

#[tokio::test]
async fn unregister_requires_ownership() {
    let router_handle = start_router().await.unwrap();
    let mut owner = connect(&router_handle).await;
    let mut thief = connect(&router_handle).await;
    owner.join_realm(REALM).await.unwrap();
    thief.join_realm(REALM).await.unwrap();

    let registration = register_ok(&mut owner, 1, "com.wamphub.svc").await;

    thief
        .send(&Message::Unregister(UnregisterMessage {
            request: Id::try_from(2).unwrap(),
            registered_registration: registration,
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(thief.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.error.as_ref(), "wamp.error.no_such_registration");
    });
}

#[tokio::test]
async fn callee_error_reaches_caller() {
    let router_handle = start_router().await.unwrap();
    let mut callee = connect(&router_handle).await;
    let mut caller = connect(&router_handle).await;
    callee.join_realm(REALM).await.unwrap();
    caller.join_realm(REALM).await.unwrap();

    register_ok(&mut callee, 1, "com.wamphub.fallible").await;

    caller
        .send(&call(9, "com.wamphub.fallible", List::default()))
        .await
        .unwrap();
    let invocation = assert_matches::assert_matches!(
        callee.recv().await,
        Ok(Message::Invocation(message)) => message.request
    );

    callee
        .send(&Message::Error(ErrorMessage {
            request_type: 68,
            request: invocation,
            details: Dictionary::default(),
            error: Uri::try_from("com.wamphub.error.out_of_cheese").unwrap(),
            arguments: List::from_iter([Value::String("redo from start".to_owned())]),
            arguments_keyword: Dictionary::default(),
        }))
        .await
        .unwrap();

    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Error(message)) => {
        assert_eq!(message.request_type, 48);
        assert_eq!(message.request, Id::try_from(9).unwrap());
        assert_eq!(message.error.as_ref(), "com.wamphub.error.out_of_cheese");
        pretty_assertions::assert_eq!(
            message.arguments,
            List::from_iter([Value::String("redo from start".to_owned())])
        );
    });
}

#[tokio::test]
async fn yield_for_unknown_invocation_is_dropped() {
    let router_handle = start_router().await.unwrap();
    let mut callee = connect(&router_handle).await;
    let mut caller = connect(&router_handle).await;
    callee.join_realm(REALM).await.unwrap();
    caller.join_realm(REALM).await.unwrap();

    register_ok(&mut callee, 1, "com.wamphub.svc").await;

    // A YIELD for an invocation that never happened is ignored.
    callee
        .send(&Message::Yield(YieldMessage {
            invocation_request: Id::try_from(987654).unwrap(),
            options: Dictionary::default(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(
        tokio::time::timeout(Duration::from_millis(300), callee.recv()).await,
        Err(_)
    );

    // The session is undisturbed: a real call still round-trips.
    caller
        .send(&call(9, "com.wamphub.svc", List::default()))
        .await
        .unwrap();
    let invocation = assert_matches::assert_matches!(
        callee.recv().await,
        Ok(Message::Invocation(message)) => message.request
    );
    callee
        .send(&Message::Yield(YieldMessage {
            invocation_request: invocation,
            options: Dictionary::default(),
            arguments: List::default(),
            arguments_keyword: Dictionary::default(),
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(caller.recv().await, Ok(Message::Result(message)) => {
        assert_eq!(message.call_request, Id::try_from(9).unwrap());
    });
}

#[tokio::test]
async fn caller_order_is_preserved_for_a_single_callee() {
    let router_handle = start_router().await.unwrap();
    let mut callee = connect(&router_handle).await;
    let mut caller = connect(&router_handle).await;
    callee.join_realm(REALM).await.unwrap();
    caller.join_realm(REALM).await.unwrap();

    register_ok(&mut callee, 1, "com.wamphub.svc").await;

    for request in 10u64..20 {
        caller
            .send(&call(
                request,
                "com.wamphub.svc",
                List::from_iter([Value::Integer(request)]),
            ))
            .await
            .unwrap();
    }

    // Invocations arrive in CALL order.
    for request in 10u64..20 {
        assert_matches::assert_matches!(callee.recv().await, Ok(Message::Invocation(message)) => {
            pretty_assertions::assert_eq!(
                message.call_arguments,
                List::from_iter([Value::Integer(request)])
            );
        });
    }
}
