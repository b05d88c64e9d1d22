use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

use loragw_pkt_fwd::fwd::conf::GlobalConf;
use loragw_pkt_fwd::fwd::error::Error;
use loragw_pkt_fwd::fwd::protocol::{self, Message, PKT_PULL_DATA, PKT_PUSH_DATA, PKT_TX_ACK};
use loragw_pkt_fwd::fwd::stats::Counter;
use loragw_pkt_fwd::fwd::transport::Transport;
use loragw_pkt_fwd::fwd::uplink::{Uplink, UplinkDispatcher};
use loragw_pkt_fwd::fwd::{Context, Forwarder, GatewayId, SharedConcentrator};
use loragw_pkt_fwd::hal::sim::SimulatedConcentrator;
use loragw_pkt_fwd::hal::{RadioFrame, BW_125KHZ, CR_LORA_4_5, DR_LORA_SF9, STAT_CRC_OK};

const GW: GatewayId = GatewayId([0xAA, 0x55, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x01]);
const WAIT: Duration = Duration::from_secs(5);


/// Records outgoing datagrams, never receives anything.
struct ChannelTransport {
    sent: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), Error> {
        let _ = self.sent.send(datagram.to_vec());
        Ok(())
    }

    async fn recv(&self, _buf: &mut [u8]) -> Result<usize, Error> {
        std::future::pending().await
    }

    async fn reconnect(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn conf_with_gateway() -> GlobalConf {
    let mut conf = GlobalConf::default();
    conf.gateway_conf.gateway_id = GW;
    conf
}

fn sf9_frame() -> RadioFrame {
    RadioFrame {
        freq_hz: 868_100_000,
        rf_chain: 0,
        if_chain: 2,
        status: STAT_CRC_OK,
        count_us: 3_512_348_611,
        bandwidth: BW_125KHZ,
        datarate: DR_LORA_SF9,
        coderate: CR_LORA_4_5,
        rssi: Some(-35.0),
        snr: Some(5.1),
        payload: (0u8..24).collect(),
        ..Default::default()
    }
}

fn push_data_body(datagram: &[u8]) -> (u16, Value) {
    match assert_ok!(protocol::decode(datagram)) {
        Message::PushData { token, gateway_id, body } => {
            assert_eq!(gateway_id, GW);
            (token, body)
        }
        other => panic!("expected PUSH_DATA, got {:?}", other),
    }
}


#[tokio::test]
async fn uplink_frame_becomes_push_data() {
    let ctx = Context::new(conf_with_gateway());
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn Transport> = Arc::new(ChannelTransport { sent: sent_tx });
    let (uplink_tx, uplink_rx) = mpsc::channel(4);

    let task = tokio::spawn(UplinkDispatcher::new(ctx.clone()).run(transport, uplink_rx));
    uplink_tx.send(Uplink::Frame(sf9_frame())).await.unwrap();

    let datagram = assert_ok!(timeout(WAIT, sent_rx.recv()).await).unwrap();
    assert_eq!(datagram[0], protocol::PROTOCOL_VERSION);
    assert_eq!(datagram[3], PKT_PUSH_DATA);
    assert_eq!(&datagram[4..12], &GW.0);

    let (_, body) = push_data_body(&datagram);
    let rxpk = &body["rxpk"][0];
    assert_eq!(rxpk["tmst"], 3_512_348_611u32);
    assert_eq!(rxpk["datr"], "SF9BW125");
    assert_eq!(rxpk["codr"], "4/5");
    assert_eq!(rxpk["modu"], "LORA");
    assert_eq!(rxpk["stat"], 1);
    assert_eq!(rxpk["size"], 24);
    assert_eq!(rxpk["rssi"], -35);
    assert_eq!(rxpk["freq"], 868.1);
    let data = BASE64_STANDARD.decode(rxpk["data"].as_str().unwrap()).unwrap();
    assert_eq!(data, (0u8..24).collect::<Vec<_>>());

    let snapshot = ctx.stats.snapshot();
    assert_eq!(snapshot.push_rcv, 1);
    assert_eq!(snapshot.push_fwd, 1);
    assert_eq!(snapshot.push_payload_bytes, 24);
    assert_eq!(snapshot.push_dgram_sent, 1);

    ctx.cancel.cancel();
    task.await.unwrap();
}


async fn recv_kind(server: &UdpSocket, kind: u8) -> (Vec<u8>, std::net::SocketAddr) {
    let mut buf = [0u8; 1024];
    loop {
        let (n, peer) = assert_ok!(timeout(WAIT, server.recv_from(&mut buf)).await).unwrap();
        if n >= 4 && buf[3] == kind {
            return (buf[..n].to_vec(), peer);
        }
    }
}

async fn wait_for(ctx: &Context, counter: Counter, value: u64) {
    let poll = async {
        while ctx.stats.get(counter) < value {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    assert_ok!(timeout(WAIT, poll).await);
}

#[tokio::test]
async fn forwarder_round_trip_over_udp() {
    let push_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pull_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut conf = conf_with_gateway();
    conf.gateway_conf.server_address = "127.0.0.1".into();
    conf.gateway_conf.serv_port_up = push_server.local_addr().unwrap().port();
    conf.gateway_conf.serv_port_down = pull_server.local_addr().unwrap().port();

    let sim = Arc::new(Mutex::new(SimulatedConcentrator::with_manual_clock(1_000_000)));
    sim.lock().unwrap().inject(RadioFrame { count_us: 0, ..sf9_frame() });
    let hal: SharedConcentrator = sim.clone();
    let forwarder = assert_ok!(Forwarder::start(conf, hal, None).await);
    let ctx = forwarder.context().clone();

    /* upstream */
    let (datagram, peer) = recv_kind(&push_server, PKT_PUSH_DATA).await;
    let (token, body) = push_data_body(&datagram);
    assert_eq!(body["rxpk"][0]["tmst"], 1_000_000);
    let ack = protocol::encode(&Message::PushAck { token });
    push_server.send_to(&ack, peer).await.unwrap();
    wait_for(&ctx, Counter::PushAck, 1).await;

    /* downstream */
    let (pull, peer) = recv_kind(&pull_server, PKT_PULL_DATA).await;
    assert_eq!(&pull[4..12], &GW.0);
    let pull_token = u16::from_le_bytes([pull[1], pull[2]]);
    pull_server
        .send_to(&protocol::encode(&Message::PullAck { token: pull_token }), peer)
        .await
        .unwrap();
    wait_for(&ctx, Counter::PullAck, 1).await;

    let txpk = json!({
        "txpk": {
            "imme": false, "tmst": 1_100_000, "freq": 869.525, "rfch": 0, "powe": 14,
            "modu": "LORA", "datr": "SF9BW125", "codr": "4/5", "ipol": true,
            "size": 4, "data": BASE64_STANDARD.encode([1u8, 2, 3, 4])
        }
    });
    pull_server
        .send_to(&protocol::encode(&Message::PullResp { token: 0x4242, body: txpk }), peer)
        .await
        .unwrap();
    wait_for(&ctx, Counter::TxRequested, 1).await;

    /* bring the counter inside the lead window of the request */
    sim.lock().unwrap().set_time(1_080_000);

    let (tx_ack, _) = recv_kind(&pull_server, PKT_TX_ACK).await;
    assert_eq!(
        assert_ok!(protocol::decode(&tx_ack)),
        Message::TxAck { token: 0x4242, gateway_id: GW, body: None }
    );
    {
        let sim = sim.lock().unwrap();
        let sent = sim.transmissions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, 1_100_000 - 1498);
        assert_eq!(sent[0].0.payload, vec![1, 2, 3, 4]);
        assert_eq!(sent[0].0.freq_hz, 869_525_000);
    }
    assert_eq!(ctx.stats.get(Counter::PullTrans), 1);

    forwarder.shutdown().await;
}

#[tokio::test]
async fn colliding_downlink_is_refused_over_udp() {
    let push_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pull_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut conf = conf_with_gateway();
    conf.gateway_conf.serv_port_up = push_server.local_addr().unwrap().port();
    conf.gateway_conf.serv_port_down = pull_server.local_addr().unwrap().port();

    let hal: SharedConcentrator = Arc::new(Mutex::new(SimulatedConcentrator::with_manual_clock(0)));
    let forwarder = assert_ok!(Forwarder::start(conf, hal, None).await);

    let (_, peer) = recv_kind(&pull_server, PKT_PULL_DATA).await;
    let request = |token: u16, tmst: u32| {
        protocol::encode(&Message::PullResp {
            token,
            body: json!({
                "txpk": {
                    "tmst": tmst, "freq": 869.525, "rfch": 0, "powe": 14, "modu": "LORA",
                    "datr": "SF12BW125", "codr": "4/5", "size": 4, "data": "AQIDBA=="
                }
            }),
        })
    };
    pull_server.send_to(&request(1, 2_000_000), peer).await.unwrap();
    pull_server.send_to(&request(2, 2_200_000), peer).await.unwrap();

    let (tx_ack, _) = recv_kind(&pull_server, PKT_TX_ACK).await;
    match assert_ok!(protocol::decode(&tx_ack)) {
        Message::TxAck { token, body: Some(body), .. } => {
            assert_eq!(token, 2);
            assert_eq!(body["txpk_ack"]["error"], "COLLISION_PACKET");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(forwarder.scheduler().queued(), 1);

    forwarder.shutdown().await;
}
