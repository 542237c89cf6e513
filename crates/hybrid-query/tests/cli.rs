use sqlx::SqlitePool;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn hq(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hq"))
        .args(args)
        .arg("--config")
        .arg(config)
        .env("HQ_CLI_TEST_KEY", "test-key")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

async fn hq_async(config: PathBuf, args: &'static [&'static str]) -> Output {
    tokio::task::spawn_blocking(move || hq(&config, args))
        .await
        .unwrap()
}

async fn setup(generation_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let shop = root.join("shop.sqlite");
    let writer = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", shop.display()))
        .await
        .unwrap();
    sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, city TEXT)")
        .execute(&writer)
        .await
        .unwrap();
    sqlx::query("INSERT INTO customers VALUES (1, 'Ada', 'London'), (2, 'Bob', 'Paris')")
        .execute(&writer)
        .await
        .unwrap();
    writer.close().await;

    let config = root.join("hq.toml");
    fs::write(
        &config,
        format!(
            r#"[store]
path = "{root}/data/vectors.sqlite"

[database]
path = "{shop}"

[embedding]
provider = "hash"
dims = 64

[generation]
provider = "openai"
model = "test-model"
url = "{url}"
api_key_env = "HQ_CLI_TEST_KEY"
retry_backoff_ms = 1
"#,
            root = root.display(),
            shop = shop.display(),
            url = generation_url,
        ),
    )
    .unwrap();
    (tmp, config)
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_init_schema_populate() {
    let (_tmp, config) = setup("http://127.0.0.1:9").await;

    let out = hq_async(config.clone(), &["init"]).await;
    assert!(out.status.success(), "init failed: {:?}", out);

    let out = hq_async(config.clone(), &["schema"]).await;
    assert!(out.status.success());
    assert!(stdout(&out).contains("customers(id INTEGER, name TEXT, city TEXT)"));

    let out = hq_async(config.clone(), &["populate"]).await;
    assert!(out.status.success(), "populate failed: {:?}", out);
    assert!(stdout(&out).contains("chunks inserted: 2"));

    let out = hq_async(config.clone(), &["populate"]).await;
    assert!(out.status.success());
    assert!(stdout(&out).contains("chunks inserted: 0"));
    assert!(stdout(&out).contains("already stored: 2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_against_mock_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("translate questions into SQL"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "```sql\nSELECT name, city FROM customers WHERE city = 'London'\n```" } }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "Ada lives in London." } }]
        })))
        .mount(&server)
        .await;

    let (_tmp, config) = setup(&server.uri()).await;
    assert!(hq_async(config.clone(), &["init"]).await.status.success());

    let out = hq_async(config.clone(), &["ask", "Who lives in London?", "--explain"]).await;
    assert!(out.status.success(), "ask failed: {:?}", out);
    let text = stdout(&out);
    assert!(text.contains("Ada lives in London."));
    assert!(text.contains("sources: sql:customers:"));
    assert!(text.contains("sql (valid): SELECT name, city FROM customers WHERE city = 'London'"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let out = hq(&tmp.path().join("nope.toml"), &["schema"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Failed to read config file"));
}
