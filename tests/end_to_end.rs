use std::{
    fs,
    net::{SocketAddr, TcpListener, TcpStream},
    path::Path,
    process::Command,
    thread::sleep,
    time::Duration,
};

use assert_cmd::cargo::CommandCargoExt;

#[tokio::test]
async fn alive_and_guarded() {
    let exe = env!("CARGO_PKG_NAME");
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path();

    let ferret::conf::Conf { addr, port, .. } = setup_conf(dir);
    let client = reqwest::Client::new();
    let cmd = || {
        let mut cmd = Command::cargo_bin(exe).unwrap();
        cmd.arg("--dir").arg(dir);
        cmd
    };

    let sock_addr: SocketAddr = format!("{addr}:{port}").parse().unwrap();
    assert!(server_is_not_listening(&sock_addr));
    let mut server = cmd().arg("server").spawn().unwrap();
    assert!(server_is_listening(&sock_addr));

    let alive = client.get(format!("http://{addr}:{port}/")).send().await;
    let guarded = client
        .get(format!("http://{addr}:{port}/api"))
        .query(&[("key", "wrong"), ("type", "rc"), ("term", "x")])
        .send()
        .await;
    let webhook = client
        .post(format!("http://{addr}:{port}/"))
        .body(r#"{"update_id": 1}"#)
        .send()
        .await;

    // XXX Stop the server BEFORE asserting, because if any assert fails
    //     we will not get a chance to clean-up.
    server.kill().unwrap();

    let alive = alive.unwrap();
    assert!(alive.status().is_success());
    assert_eq!(alive.text().await.unwrap(), "ferret is running");

    let guarded = guarded.unwrap();
    assert_eq!(guarded.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = guarded.json().await.unwrap();
    assert_eq!(body["error"], "Invalid API Key");
    assert_eq!(body["api_by"], "e2e");

    let webhook = webhook.unwrap();
    assert_eq!(webhook.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}

#[test]
fn gift_code_lands_in_the_ledger() {
    let exe = env!("CARGO_PKG_NAME");
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path();
    let conf = setup_conf(dir);

    let output = Command::cargo_bin(exe)
        .unwrap()
        .arg("--dir")
        .arg(dir)
        .args(["gift-code", "WELCOME", "3"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let ledger = fs::read_to_string(dir.join(&conf.data_file)).unwrap();
    let ledger: serde_json::Value = serde_json::from_str(&ledger).unwrap();
    assert_eq!(ledger["giftCodes"]["WELCOME"], 3);
}

fn setup_conf(workdir: &Path) -> ferret::conf::Conf {
    let conf = ferret::conf::Conf {
        log_level: tracing::Level::INFO,
        addr: "127.0.0.1".parse().unwrap(),
        port: free_port(),
        api_key: "e2e-key".to_string(),
        attribution: "e2e".to_string(),
        upstream_timeout: 5.0,
        data_file: "db.json".into(),
        daily_limit: 10,
        cors_origins: Vec::new(),
        telegram: ferret::conf::ConfTelegram::default(),
        upstreams: Default::default(),
        upi: Default::default(),
        tls: None,
    };
    let conf_str = toml::to_string(&conf).unwrap();
    let conf_dir = workdir.join("conf");
    fs::create_dir_all(&conf_dir).unwrap();
    fs::write(conf_dir.join("conf.toml"), &conf_str).unwrap();
    conf
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn server_is_not_listening(addr: &SocketAddr) -> bool {
    TcpStream::connect(addr).is_err()
}

fn server_is_listening(addr: &SocketAddr) -> bool {
    let interval = Duration::from_secs_f32(0.25);
    let attempts = 20;
    retry_until_true(|| TcpStream::connect(addr).is_ok(), interval, attempts)
}

fn retry_until_true<F: Fn() -> bool>(
    f: F,
    interval: Duration,
    mut attempts: usize,
) -> bool {
    while attempts > 0 {
        if f() {
            return true;
        } else {
            attempts -= 1;
            sleep(interval);
        }
    }
    false
}
