/// Chat server over real HTTP: status codes, pairing rules, read tracking
mod common;

use common::{client_config, settle, spawn_server};
use hushline_core::backend::{ChatBackend, HttpBackend};
use hushline_core::{ChatError, ChatState, Sender, Session};
use std::collections::HashSet;
use tempfile::TempDir;

#[tokio::test]
async fn test_create_and_join_over_http() {
    let temp_dir = TempDir::new().unwrap();
    let url = spawn_server(&temp_dir).await;
    let backend = HttpBackend::new(format!("{}/", url));

    let a = backend.create_user().await.unwrap();
    let b = backend.create_user().await.unwrap();
    let c = backend.create_user().await.unwrap();
    assert_ne!(a.id, b.id);

    let chat = backend.create_chat(a.id).await.unwrap();
    assert_eq!(chat.state, ChatState::Pending);
    assert_eq!(chat.chat_code.len(), 8);

    assert!(matches!(
        backend.join_chat(b.id, "NOPE2345").await,
        Err(ChatError::ChatNotFound(_))
    ));

    let joined = backend.join_chat(b.id, &chat.chat_code).await.unwrap();
    assert_eq!(joined.id, chat.id);
    assert_eq!(joined.state, ChatState::Active);

    assert!(matches!(
        backend.join_chat(c.id, &chat.chat_code).await,
        Err(ChatError::ChatFull(_))
    ));
}

#[tokio::test]
async fn test_codes_are_unique_over_http() {
    let temp_dir = TempDir::new().unwrap();
    let url = spawn_server(&temp_dir).await;
    let backend = HttpBackend::new(url);
    let user = backend.create_user().await.unwrap();

    let mut codes = HashSet::new();
    for _ in 0..20 {
        let chat = backend.create_chat(user.id).await.unwrap();
        assert!(codes.insert(chat.chat_code));
    }
    assert_eq!(backend.list_chats(user.id).await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_messages_unread_and_permissions() {
    let temp_dir = TempDir::new().unwrap();
    let url = spawn_server(&temp_dir).await;
    let backend = HttpBackend::new(url);

    let a = backend.create_user().await.unwrap();
    let b = backend.create_user().await.unwrap();
    let outsider = backend.create_user().await.unwrap();
    let chat = backend.create_chat(a.id).await.unwrap();
    backend.join_chat(b.id, &chat.chat_code).await.unwrap();

    backend.send_message(chat.id, a.id, "first").await.unwrap();
    backend.send_message(chat.id, a.id, "second").await.unwrap();

    let listed = backend.list_chats(b.id).await.unwrap();
    assert_eq!(listed[0].unread_count, 2);
    assert_eq!(listed[0].last_message.as_deref(), Some("second"));
    assert!(listed[0].online);

    let thread = backend.list_messages(chat.id, b.id).await.unwrap();
    let contents: Vec<&str> = thread.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert!(thread.iter().all(|m| m.sender == Sender::Other));

    assert_eq!(backend.list_chats(b.id).await.unwrap()[0].unread_count, 0);

    assert!(matches!(
        backend.send_message(chat.id, b.id, "  ").await,
        Err(ChatError::InvalidRequest(_))
    ));
    match backend.send_message(chat.id, outsider.id, "let me in").await {
        Err(ChatError::Transport(msg)) => assert!(msg.contains("403")),
        other => panic!("expected 403, got {:?}", other),
    }
}

#[tokio::test]
async fn test_routing_and_bad_requests() {
    let temp_dir = TempDir::new().unwrap();
    let url = spawn_server(&temp_dir).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/nowhere", url)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client.delete(format!("{}/chats", url)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 405);

    let resp = client
        .request(reqwest::Method::OPTIONS, format!("{}/messages", url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let resp = client.get(format!("{}/chats", url)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .post(format!("{}/chats", url))
        .body("{\"action\":\"dance\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().is_some());

    let resp = client
        .post(format!("{}/chats", url))
        .json(&serde_json::json!({ "action": "create_chat", "user_id": 424242 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn test_two_sessions_over_http() {
    let temp_dir = TempDir::new().unwrap();
    let url = spawn_server(&temp_dir).await;
    let mut alice = Session::connect(client_config(&temp_dir.path().join("alice"), &url)).unwrap();
    let mut bob = Session::connect(client_config(&temp_dir.path().join("bob"), &url)).unwrap();
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let chat = alice.create_chat().await.unwrap();
    bob.join_chat(&chat.chat_code).await.unwrap();
    bob.send("hello over http").await.unwrap();

    alice.select_chat(Some(chat.id));
    settle(&mut alice, |s| {
        s.active_thread()
            .iter()
            .any(|m| m.content == "hello over http" && m.sender == Sender::Other)
    })
    .await;
    settle(&mut alice, |s| {
        s.chats()
            .iter()
            .any(|c| c.id == chat.id && c.state == ChatState::Active)
    })
    .await;
}
