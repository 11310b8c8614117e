use assert_cmd::prelude::*;
use secp256k1::{Keypair, Secp256k1};
use std::{fs, process::Command};
use tempfile::TempDir;

const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

fn write_env(dir: &TempDir) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "STATE_ROOT={}\nVERIFY_SIG=0\nCONNECT_TIMEOUT_SECS=2\n",
        dir.path().join("state").display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn public_key(secret: &str) -> String {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &hex::decode(secret).unwrap()).unwrap();
    hex::encode(kp.x_only_public_key().0.serialize())
}

fn relaychat(env_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("relaychat").unwrap();
    cmd.env_remove("SECRET_KEY")
        .env_remove("STATE_ROOT")
        .args(["--env", env_path]);
    cmd
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::cargo_bin("relaychat")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["init", "relays", "relay", "group", "key", "reset", "chat"] {
        assert!(text.contains(cmd));
    }
}

#[test]
fn init_writes_env_and_state_root() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join("conf").join(".env");
    Command::cargo_bin("relaychat")
        .unwrap()
        .env_remove("STATE_ROOT")
        .args(["--env", env_path.to_str().unwrap(), "init"])
        .assert()
        .success();
    let data = fs::read_to_string(&env_path).unwrap();
    assert!(data.contains("STATE_ROOT="));
    assert!(data.contains("BOOTSTRAP_RELAYS="));
    assert!(dir.path().join("conf").join("relaychat-data").is_dir());
}

#[test]
fn relays_lists_persisted_groups() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    let empty = relaychat(&env_path)
        .arg("relays")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(empty.is_empty());

    fs::create_dir_all(dir.path().join("state")).unwrap();
    fs::write(
        dir.path().join("state").join("relays.json"),
        r#"[{"url":"wss://groups.example","groups":["/","/pizza"]}]"#,
    )
    .unwrap();
    let listed = relaychat(&env_path)
        .arg("relays")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(
        String::from_utf8(listed).unwrap(),
        "wss://groups.example\n  /\n  /pizza\n"
    );
}

#[test]
fn group_add_on_unknown_relay_fails() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    let output = relaychat(&env_path)
        .args(["group", "add", "wss://unknown", "/x"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8(output).unwrap().contains("relay not found"));
    assert!(!dir.path().join("state").join("relays.json").exists());
}

#[test]
fn key_import_show_and_reset() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    relaychat(&env_path)
        .args(["key", "show"])
        .assert()
        .failure();

    let imported = relaychat(&env_path)
        .args(["key", "import", SECRET])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let expected = format!("{}\n", public_key(SECRET));
    assert_eq!(String::from_utf8(imported).unwrap(), expected);

    let shown = relaychat(&env_path)
        .args(["key", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(shown).unwrap(), expected);

    relaychat(&env_path)
        .args(["key", "import", "not-hex"])
        .assert()
        .failure();

    relaychat(&env_path).arg("reset").assert().success();
    assert!(!dir.path().join("state").join("identity.key").exists());
    relaychat(&env_path)
        .args(["key", "show"])
        .assert()
        .failure();
}

#[test]
fn relay_remove_unknown_fails() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    relaychat(&env_path)
        .args(["relay", "remove", "wss://nowhere"])
        .assert()
        .failure();
}
