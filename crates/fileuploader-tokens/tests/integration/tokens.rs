use std::time::Duration;

use futures::future;

use fileuploader_tokens::{TokenError, TokenLookup, TokenManager};

use crate::{
    MockPeer, issue_tokens, reply_with, setup_manager, setup_manager_with, token_issuing_peer,
};

fn token_value(result: Result<Option<fileuploader_tokens::Token>, TokenError>) -> String {
    result.unwrap().expect("expected a token").value
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_send_once() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");

    let gets = future::join_all((0..5).map(|_| manager.get(&peer)));
    let server = async {
        peer.wait_for_sends(1).await;
        peer.deliver(":irc.example.org EXTJWT * * :token");
    };
    let (results, ()) = tokio::join!(gets, server);

    for result in results {
        assert_eq!(token_value(result), "token");
    }
    assert_eq!(peer.sent_count("EXTJWT"), 1);
    assert_eq!(peer.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_share_failure() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");

    let gets = future::join_all((0..3).map(|_| manager.get(&peer)));
    let (results, ()) = tokio::join!(gets, async {
        peer.wait_for_sends(1).await;
        peer.deliver(":irc.example.org FAIL EXTJWT NO_SUCH_SERVICE :No such service");
    });

    let expected = Err(TokenError::Protocol("NO_SUCH_SERVICE: No such service".into()));
    for result in results {
        assert_eq!(result, expected);
    }
    assert_eq!(peer.sent_count("EXTJWT"), 1);
}

#[tokio::test]
async fn test_request_format() {
    let manager = setup_manager();
    let peer = token_issuing_peer("irc.example.org");

    manager.get(&peer).await.unwrap();

    let sent = peer.sent();
    assert_eq!(sent.len(), 1);
    insta::assert_snapshot!(sent[0], @"EXTJWT *");
}

#[tokio::test]
async fn test_request_with_service() {
    let manager = setup_manager_with(|config| config.service = Some("filehost".into()));
    let peer = MockPeer::new("irc.example.org");
    reply_with(&peer, ":irc.example.org EXTJWT * filehost :service-token");

    let token = manager.get(&peer).await;
    assert_eq!(token_value(token), "service-token");
    insta::assert_snapshot!(peer.sent()[0], @"EXTJWT * filehost");
}

#[tokio::test(start_paused = true)]
async fn test_token_freshness() {
    let manager = setup_manager();
    let peer = token_issuing_peer("irc.example.org");

    assert_eq!(token_value(manager.get(&peer).await), "token-1");

    tokio::time::advance(Duration::from_secs(15)).await;
    match manager.lookup(&peer) {
        TokenLookup::Ready(token) => assert_eq!(token.value, "token-1"),
        lookup => panic!("expected a cached token, got {lookup:?}"),
    }
    assert_eq!(peer.sent_count("EXTJWT"), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(manager.lookup(&peer).is_pending());
    assert_eq!(token_value(manager.get(&peer).await), "token-2");
    assert_eq!(peer.sent_count("EXTJWT"), 2);
}

#[tokio::test]
async fn test_zero_token_age() {
    let manager = setup_manager_with(|config| config.max_token_age = Duration::ZERO);
    let peer = token_issuing_peer("irc.example.org");

    // the requested token is handed out even if it aged past the limit meanwhile
    assert_eq!(token_value(manager.get(&peer).await), "token-1");

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(token_value(manager.get(&peer).await), "token-2");
    assert_eq!(peer.sent_count("EXTJWT"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_peer() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");
    reply_with(&peer, ":irc.example.org 421 alice EXTJWT :Unknown command");

    assert_eq!(manager.get(&peer).await, Ok(None));
    assert!(manager.is_unsupported(&peer));

    // no second request right away
    assert!(matches!(manager.lookup(&peer), TokenLookup::Unsupported));
    assert_eq!(manager.get(&peer).await, Ok(None));
    assert_eq!(peer.sent_count("EXTJWT"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_expires() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");
    reply_with(&peer, ":irc.example.org 421 alice EXTJWT :Unknown command");

    assert_eq!(manager.get(&peer).await, Ok(None));

    // the server got upgraded in the meantime
    issue_tokens(&peer);

    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    assert_eq!(manager.get(&peer).await, Ok(None));
    assert_eq!(peer.sent_count("EXTJWT"), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!manager.is_unsupported(&peer));
    assert_eq!(token_value(manager.get(&peer).await), "token-1");
    assert_eq!(peer.sent_count("EXTJWT"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_shared_by_waiters() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");

    let gets = future::join_all((0..3).map(|_| manager.get(&peer)));
    let (results, ()) = tokio::join!(gets, async {
        peer.wait_for_sends(1).await;
        peer.deliver(":irc.example.org 421 alice extjwt :Unknown command");
    });

    assert!(results.iter().all(|result| result == &Ok(None)));
    assert_eq!(peer.sent_count("EXTJWT"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_not_cached() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");

    let result = manager.get(&peer).await;
    assert_eq!(result, Err(TokenError::Timeout(Duration::from_secs(10))));
    assert_eq!(peer.listener_count(), 0);
    assert!(!manager.is_unsupported(&peer));

    issue_tokens(&peer);
    assert_eq!(token_value(manager.get(&peer).await), "token-1");
    assert_eq!(peer.sent_count("EXTJWT"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_custom_timeout() {
    let manager = setup_manager_with(|config| config.request_timeout = Duration::from_secs(2));
    let peer = MockPeer::new("irc.example.org");

    let result = manager.get(&peer).await;
    assert_eq!(result, Err(TokenError::Timeout(Duration::from_secs(2))));
}

#[tokio::test]
async fn test_fail_not_cached() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");
    reply_with(
        &peer,
        ":irc.example.org FAIL EXTJWT NO_SUCH_SERVICE :No such service",
    );

    let result = manager.get(&peer).await;
    assert!(matches!(result, Err(TokenError::Protocol(_))));
    assert!(!manager.is_unsupported(&peer));

    let result = manager.get(&peer).await;
    assert!(matches!(result, Err(TokenError::Protocol(_))));
    assert_eq!(peer.sent_count("EXTJWT"), 2);
}

#[tokio::test]
async fn test_empty_token() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");
    reply_with(&peer, ":irc.example.org EXTJWT * * :");

    let result = manager.get(&peer).await;
    assert_eq!(result, Err(TokenError::Malformed("empty token".into())));
}

#[tokio::test]
async fn test_disconnect_during_request() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");

    let (result, ()) = tokio::join!(manager.get(&peer), async {
        peer.wait_for_sends(1).await;
        peer.disconnect();
    });
    assert_eq!(result, Err(TokenError::Disconnected));
}

#[tokio::test]
async fn test_send_failure() {
    let manager = setup_manager();
    let peer = MockPeer::new("irc.example.org");
    peer.disconnect();

    let result = manager.get(&peer).await;
    assert_eq!(result, Err(TokenError::SendFailed("disconnected".into())));
    assert_eq!(peer.listener_count(), 0);
}

#[tokio::test]
async fn test_peers_are_independent() {
    let manager = setup_manager();
    let first = token_issuing_peer("irc.example.org");
    let second = token_issuing_peer("irc.example.org");

    assert_eq!(token_value(manager.get(&first).await), "token-1");
    assert_eq!(token_value(manager.get(&second).await), "token-1");
    assert_eq!(token_value(manager.get(&first).await), "token-1");

    assert_eq!(first.sent_count("EXTJWT"), 1);
    assert_eq!(second.sent_count("EXTJWT"), 1);
}

#[tokio::test]
async fn test_managers_are_independent() {
    let first = setup_manager();
    let second = TokenManager::new(first.config().clone());
    let peer = token_issuing_peer("irc.example.org");

    assert_eq!(token_value(first.get(&peer).await), "token-1");
    assert_eq!(token_value(second.get(&peer).await), "token-2");
    assert_eq!(peer.sent_count("EXTJWT"), 2);
}

#[tokio::test]
async fn test_forget() {
    let manager = setup_manager();
    let peer = token_issuing_peer("irc.example.org");

    assert_eq!(token_value(manager.get(&peer).await), "token-1");
    manager.forget(&peer);
    assert_eq!(token_value(manager.get(&peer).await), "token-2");

    reply_with(&peer, ":irc.example.org 421 alice EXTJWT :Unknown command");
    manager.forget(&peer);
    assert_eq!(manager.get(&peer).await, Ok(None));
    assert!(manager.is_unsupported(&peer));

    issue_tokens(&peer);
    manager.forget(&peer);
    assert!(!manager.is_unsupported(&peer));
    assert_eq!(token_value(manager.get(&peer).await), "token-1");
}
