use anyhow::Result;
use inflow::rendezvous::{client_key, parse_key};

use crate::common;

#[test]
fn partial_run_keys_use_the_client_device_and_zero_frame() -> Result<()> {
    let session = common::new_cpu_session()?;
    let client = &session.list_devices()[0];

    let key = client_key(client, "a:0");
    let expected = format!(
        "{};{:x};{};a:0;0:0",
        client.name, client.incarnation, client.name
    );
    assert_eq!(key, expected);

    let parsed = parse_key(&key)?;
    assert_eq!(parsed.src_device, client.name);
    assert_eq!(parsed.dst_device, client.name);
    assert_eq!(parsed.src_incarnation, client.incarnation);
    assert_eq!(parsed.tensor_name, "a:0");
    assert_eq!((parsed.frame_id, parsed.iter_id), (0, 0));
    Ok(())
}

#[test]
fn malformed_keys_are_invalid_argument() {
    for key in [
        "",
        "only;three;fields",
        "a;nothex;b;t;0:0",
        "a;1f;b;t;frameiter",
        "a;1f;b;t;x:0",
    ] {
        let err = parse_key(key).unwrap_err();
        assert_eq!(err.code(), inflow::Code::InvalidArgument, "key: {key}");
    }
}
