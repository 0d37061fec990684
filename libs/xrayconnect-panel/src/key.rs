/// Builds the share URI a VPN client imports.
///
/// `vmess` is emitted in the bare form; clients that need the base64 JSON
/// variant get it from the subscription link instead.
pub fn generate_connection_key(protocol: &str, uuid: &str, host: &str, port: u16, remark: &str) -> String {
    let base = format!("{protocol}://{uuid}@{host}:{port}");
    match protocol {
        "vless" => format!("{base}?security=reality&type=tcp&headerType=none#{remark}"),
        "trojan" => format!("{base}?security=tls#{remark}"),
        _ => base,
    }
}
