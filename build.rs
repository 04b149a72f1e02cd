const COMMANDS: &[&str] = &["start_scan", "stop_scan", "request_permissions"];

fn main() {
    tauri_plugin::Builder::new(COMMANDS).build();
}
