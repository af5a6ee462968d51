use fileuploader_tokens::uploads::{AttachSummary, Upload, attach_tokens};

use crate::{MockPeer, reply_with, setup_manager, token_issuing_peer};

#[tokio::test]
async fn test_one_token_per_peer() {
    let manager = setup_manager();
    let kiwi = token_issuing_peer("irc.kiwiirc.com");
    let libera = token_issuing_peer("irc.libera.chat");

    let mut uploads = vec![
        Upload::new(kiwi.clone()),
        Upload::new(libera.clone()),
        Upload::new(kiwi.clone()),
    ];
    let summary = attach_tokens(&manager, &mut uploads).await;

    assert_eq!(
        summary,
        AttachSummary {
            attached: 3,
            skipped: 0,
            failed: 0,
        }
    );
    assert_eq!(kiwi.sent_count("EXTJWT"), 1);
    assert_eq!(libera.sent_count("EXTJWT"), 1);
    assert!(uploads.iter().all(|upload| upload.token() == Some("token-1")));
}

#[tokio::test]
async fn test_cached_tokens_reused() {
    let manager = setup_manager();
    let peer = token_issuing_peer("irc.kiwiirc.com");

    let mut uploads = vec![Upload::new(peer.clone())];
    attach_tokens(&manager, &mut uploads).await;

    let mut more_uploads = vec![Upload::new(peer.clone()), Upload::new(peer.clone())];
    let summary = attach_tokens(&manager, &mut more_uploads).await;

    assert_eq!(summary.attached, 2);
    assert_eq!(more_uploads[1].token(), Some("token-1"));
    assert_eq!(peer.sent_count("EXTJWT"), 1);
}

#[tokio::test]
async fn test_skips_peers_without_extjwt() {
    let manager = setup_manager();
    let peer = token_issuing_peer("irc.example.org");
    peer.set_isupport("EXTJWT", None);

    let mut uploads = vec![Upload::new(peer.clone())];
    let summary = attach_tokens(&manager, &mut uploads).await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(uploads[0].token(), None);
    assert!(peer.sent().is_empty());
}

#[tokio::test]
async fn test_unsupported_and_failed_peers() {
    let manager = setup_manager();
    let unsupported = MockPeer::new("old.example.org");
    reply_with(&unsupported, ":old.example.org 421 alice EXTJWT :Unknown command");
    let failing = MockPeer::new("broken.example.org");
    reply_with(
        &failing,
        ":broken.example.org FAIL EXTJWT NO_SUCH_SERVICE :No such service",
    );
    let working = token_issuing_peer("irc.example.org");

    let mut uploads = vec![
        Upload::new(unsupported.clone()),
        Upload::new(failing.clone()),
        Upload::new(working.clone()),
        Upload::new(failing.clone()),
    ];
    let summary = attach_tokens(&manager, &mut uploads).await;

    assert_eq!(
        summary,
        AttachSummary {
            attached: 1,
            skipped: 1,
            failed: 2,
        }
    );
    assert_eq!(uploads[0].token(), None);
    assert_eq!(uploads[1].token(), None);
    assert_eq!(uploads[2].token(), Some("token-1"));
    assert_eq!(failing.sent_count("EXTJWT"), 1);

    // the unsupported peer is remembered, the failure is not
    let summary = attach_tokens(&manager, &mut uploads).await;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(unsupported.sent_count("EXTJWT"), 1);
    assert_eq!(failing.sent_count("EXTJWT"), 2);
}
