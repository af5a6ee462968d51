use std::time::Duration;

use fileuploader_tokens::TokenError;
use fileuploader_tokens::correlator::{Verdict, await_response};
use fileuploader_tokens::tokens::match_extjwt;

use crate::MockPeer;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_multipart_reassembly() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let response = await_response(&peer, match_extjwt, TIMEOUT);
    assert_eq!(peer.listener_count(), 1);

    peer.deliver(":irc.example.org EXTJWT * * * :AB");
    peer.deliver(":irc.example.org EXTJWT * * :CD");

    assert_eq!(response.await, Ok("ABCD".to_owned()));
    assert_eq!(peer.listener_count(), 0);
}

#[tokio::test]
async fn test_unrelated_messages_skipped() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let response = await_response(&peer, match_extjwt, TIMEOUT);

    peer.deliver(":alice!alice@example.org PRIVMSG #kiwiirc :EXTJWT * * :nope");
    peer.deliver(":irc.example.org EXTJWT #kiwiirc * :channel-token");
    peer.deliver(":irc.example.org 421 alice FOO :Unknown command");
    peer.deliver(":irc.example.org EXTJWT * * :server-token");

    assert_eq!(response.await, Ok("server-token".to_owned()));
}

#[tokio::test]
async fn test_messages_before_subscription_ignored() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    peer.deliver(":irc.example.org EXTJWT * * :old-token");
    let response = await_response(&peer, match_extjwt, TIMEOUT);
    peer.deliver(":irc.example.org EXTJWT * * :new-token");

    assert_eq!(response.await, Ok("new-token".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn test_timeout() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let response = await_response(&peer, match_extjwt, TIMEOUT);
    // an incomplete response does not help
    peer.deliver(":irc.example.org EXTJWT * * * :AB");

    assert_eq!(response.await, Err(TokenError::Timeout(TIMEOUT)));
    assert_eq!(peer.listener_count(), 0);
}

#[tokio::test]
async fn test_unknown_command() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let response = await_response(&peer, match_extjwt, TIMEOUT);
    peer.deliver(":irc.example.org 421 alice EXTJWT :Unknown command");

    assert_eq!(
        response.await,
        Err(TokenError::Unsupported("EXTJWT".to_owned()))
    );
    assert_eq!(peer.listener_count(), 0);
}

#[tokio::test]
async fn test_disconnect() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let response = await_response(&peer, match_extjwt, TIMEOUT);
    peer.deliver(":irc.example.org EXTJWT * * * :AB");
    peer.disconnect();

    assert_eq!(response.await, Err(TokenError::Disconnected));
}

#[tokio::test]
async fn test_dropped_response_unsubscribes() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let first = await_response(&peer, match_extjwt, TIMEOUT);
    let second = await_response(&peer, match_extjwt, TIMEOUT);
    assert_eq!(peer.listener_count(), 2);

    drop(first);
    assert_eq!(peer.listener_count(), 1);

    // the remaining listener still gets everything
    peer.deliver(":irc.example.org EXTJWT * * :token");
    assert_eq!(second.await, Ok("token".to_owned()));
    assert_eq!(peer.listener_count(), 0);
}

#[tokio::test]
async fn test_custom_matcher() {
    fileuploader_test::setup();
    let peer = MockPeer::new("irc.example.org");

    let mut seen = 0;
    let matcher = move |message: &fileuploader_tokens::Message| {
        if message.command != "PONG" {
            return Verdict::Skip;
        }
        seen += 1;
        match seen {
            3 => Verdict::Complete(message.last_param().unwrap_or_default().to_owned()),
            _ => Verdict::Partial(format!("{seen},")),
        }
    };

    let response = await_response(&peer, matcher, TIMEOUT);
    peer.deliver("PONG irc.example.org :a");
    peer.deliver("PING :irc.example.org");
    peer.deliver("PONG irc.example.org :b");
    peer.deliver("PONG irc.example.org :c");

    assert_eq!(response.await, Ok("1,2,c".to_owned()));
}
