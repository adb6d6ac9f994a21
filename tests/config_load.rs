use reliq::config::load_config;
use reliq::Config;

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("reliq.toml").expect("failed to load config");

    assert_eq!(cfg.server.bind_addr, "127.0.0.1:7379");
    assert_eq!(cfg.server.max_connections, 1024);
    assert_eq!(cfg.server.max_frame_bytes, 8_388_608);
    assert_eq!(cfg.queues.default_pop_count, 1);
    assert_eq!(cfg.queues.max_payload_bytes, 1_048_576);
    assert_eq!(cfg.queues.default_recover_min_idle_ms, 30_000);
    assert_eq!(cfg.snapshot.path.as_deref(), Some("./reliq-snapshot.bin"));
    assert!(cfg.snapshot.load_on_start);
    assert!(cfg.snapshot.save_on_shutdown);
}
