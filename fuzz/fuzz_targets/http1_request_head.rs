#![no_main]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::OnceLock;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use tokio::io::BufReader;

use fanout_proxy::proxy::http::fuzzing::parse_http1_request_head;

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("build tokio runtime")
    })
}

fuzz_target!(|data: &[u8]| {
    let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12345));
    let max_header_bytes = data.len().clamp(1, 32 * 1024);

    runtime().block_on(async {
        let mut reader = BufReader::new(data);
        let _ = parse_http1_request_head(
            &mut reader,
            peer,
            Duration::from_millis(10),
            max_header_bytes,
        )
        .await;
    });
});
