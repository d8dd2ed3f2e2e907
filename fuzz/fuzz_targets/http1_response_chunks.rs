#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;

use fanout_proxy::proxy::http::fuzzing::read_response_chunks;

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
    if data.is_empty() {
        return;
    }
    let chunk_size = (data[0] as usize % 64) + 1;
    let response = &data[1..];

    runtime().block_on(async {
        // `&[u8]` reads straight from the slice and reports EOF at its end.
        let _ = read_response_chunks(response, chunk_size, 1024).await;
    });
});
