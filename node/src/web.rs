const VIEWER_HTML: &str = include_str!("../web/cam.html");

/// Viewer page for `/cam`. With a dedicated stream port the image points at
/// that port on the same host, otherwise at `/` on the serving origin.
pub fn viewer_page(stream_port: u16) -> String {
    let port = if stream_port == 0 {
        String::new()
    } else {
        stream_port.to_string()
    };
    VIEWER_HTML.replace("{{stream_port}}", &port)
}

/// Body of the `/flash` response, as polled by the viewer page.
pub fn flash_state_text(lit: bool) -> &'static str {
    if lit {
        "ON"
    } else {
        "OFF"
    }
}
