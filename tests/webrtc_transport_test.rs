//! Настоящий peer connection без ICE серверов: только локальные описания, без сети.

use bytes::Bytes;
use rendezvous_call_lib::error::SignalingError;
use rendezvous_call_lib::peer::connection::WebrtcTransport;
use rendezvous_call_lib::peer::media::LocalMedia;
use rendezvous_call_lib::peer::transport::{MediaTransport, TransportEvent};
use rendezvous_call_lib::peer::types::SdpKind;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn offer_carries_local_tracks() {
    let transport = WebrtcTransport::new(&[]).await.unwrap();
    transport.attach_media(&LocalMedia::camera("cam")).await.unwrap();

    let offer = transport.create_offer().await.unwrap();
    assert_eq!(offer.kind, SdpKind::Offer);
    assert!(offer.sdp.contains("m=audio"));
    assert!(offer.sdp.contains("m=video"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn two_transports_exchange_descriptions() {
    let a = WebrtcTransport::new(&[]).await.unwrap();
    let b = WebrtcTransport::new(&[]).await.unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    a.set_event_sink(tx);

    a.attach_media(&LocalMedia::camera("a")).await.unwrap();
    b.attach_media(&LocalMedia::camera("b")).await.unwrap();

    let offer = a.create_offer().await.unwrap();
    b.set_remote_description(offer).await.unwrap();
    let answer = b.create_answer().await.unwrap();
    assert_eq!(answer.kind, SdpKind::Answer);
    assert!(answer.sdp.contains("m=audio"));
    a.set_remote_description(answer).await.unwrap();

    // сбор кандидатов завершается и без STUN/TURN
    let gathered = timeout(Duration::from_secs(15), async {
        while let Some(event) = events.recv().await {
            if event == TransportEvent::GatheringComplete {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(gathered.ok(), Some(true));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn samples_go_only_to_known_tracks() {
    let transport = WebrtcTransport::new(&[]).await.unwrap();
    transport.attach_media(&LocalMedia::camera("cam")).await.unwrap();

    let err = transport
        .write_sample("nope", Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::Precondition(_)));

    transport.detach_media().await.unwrap();
    assert!(transport
        .write_sample("cam-audio", Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
        .await
        .is_err());
}
