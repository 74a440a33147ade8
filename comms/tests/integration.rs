use std::io;

use comms::{
    LocalTransport, Transport,
    msg::{Command, Msg, Payload},
};
use tokio::io as tokio_io;

#[tokio::test]
async fn frames_survive_a_split_stream() -> io::Result<()> {
    let (one, two) = tokio_io::duplex(64);
    let (rx1, tx1) = tokio_io::split(one);
    let (rx2, tx2) = tokio_io::split(two);
    let (_, mut tx) = comms::channel(rx1, tx1);
    let (mut rx, _) = comms::channel(rx2, tx2);

    // Bigger than the duplex buffer, the writer has to wait for the reader.
    let data: Vec<f32> = (0..100).map(|i| i as f32).collect();

    let writer = async {
        tx.send(&Msg::Data(Payload::Delta { tag: 1, data: &data })).await?;
        tx.send(&Msg::Err("bad shape".into())).await?;
        tx.send(&Msg::Control(Command::Disconnect)).await
    };

    let reader = async {
        let mut buf: Vec<f32> = Vec::new();

        let msg: Msg = rx.recv_into(&mut buf).await?;
        let Msg::Data(Payload::Delta { tag: 1, data: got }) = msg else {
            panic!("expected a delta, got {msg:?}");
        };
        assert_eq!(got, &data[..]);

        let msg: Msg = rx.recv_into(&mut buf).await?;
        assert!(matches!(msg, Msg::Err(ref text) if text == "bad shape"));

        let msg: Msg = rx.recv_into(&mut buf).await?;
        assert!(matches!(msg, Msg::Control(Command::Disconnect)));
        Ok::<_, io::Error>(())
    };

    tokio::try_join!(writer, reader)?;
    Ok(())
}

#[test]
fn local_mesh_routes_by_tag() {
    let mesh = LocalTransport::mesh(2);

    let mut weights = mesh[1].irecv_any(0).unwrap();
    let mut biases = mesh[1].irecv_any(1).unwrap();

    mesh[0].isend(1, 1, &[0.5]).unwrap();
    assert!(!weights.test().unwrap());
    assert!(biases.test().unwrap());

    mesh[0].isend(1, 0, &[1.0, 2.0]).unwrap();
    assert!(weights.test().unwrap());
    assert_eq!(weights.count(), Some(2));
}
