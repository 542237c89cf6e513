use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hybrid_query::config::{EmbeddingConfig, GenerationConfig};
use hybrid_query::embedding::{OllamaProvider, OpenAIProvider};
use hybrid_query::generation::{OllamaGenerator, OpenAiGenerator};
use hybrid_query_core::embedding::EmbeddingProvider;
use hybrid_query_core::error::EngineError;
use hybrid_query_core::generation::Generator;
use hybrid_query_core::prompt::{answer_request, sql_request};
use hybrid_query_core::schema::SchemaSnapshot;

fn embedding_config(provider: &str, url: String) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: provider.into(),
        model: Some("embed-small".into()),
        dims: Some(3),
        url: Some(url),
        max_retries: 2,
        timeout_secs: 5,
        ..Default::default()
    }
}

fn generation_config(provider: &str, url: String) -> GenerationConfig {
    GenerationConfig {
        provider: provider.into(),
        model: "llama-3.1-8b-instant".into(),
        url: Some(url),
        api_key_env: "HQ_TEST_API_KEY".into(),
        temperature: 0.1,
        max_tokens: 300,
        timeout_secs: 5,
        retry_backoff_ms: 1,
    }
}

#[tokio::test]
async fn test_openai_embeddings_ordered_by_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "embed-small" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                { "index": 0, "embedding": [1.0, 0.0, 0.0] }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider =
        OpenAIProvider::with_api_key(&embedding_config("openai", server.uri()), "test-key").unwrap();
    let vectors = provider
        .embed(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
}

#[tokio::test]
async fn test_openai_embeddings_retry_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [0.5, 0.5, 0.0] }]
        })))
        .mount(&server)
        .await;

    let provider = OpenAIProvider::with_api_key(&embedding_config("openai", server.uri()), "k")
        .unwrap()
        .with_backoff(Duration::from_millis(10));
    let v = provider.embed_query("hello").await.unwrap();
    assert_eq!(v, vec![0.5, 0.5, 0.0]);
}

#[tokio::test]
async fn test_turn_embeddings_make_a_single_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let config = embedding_config("openai", server.uri()).for_turns();
    let provider = OpenAIProvider::with_api_key(&config, "k")
        .unwrap()
        .with_backoff(Duration::from_millis(10));
    let err = provider.embed_query("hello").await.unwrap_err();
    assert!(matches!(err, EngineError::EmbeddingUnavailable(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_openai_embeddings_do_not_retry_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAIProvider::with_api_key(&embedding_config("openai", server.uri()), "k")
        .unwrap()
        .with_backoff(Duration::from_millis(10));
    let err = provider.embed_query("hello").await.unwrap_err();
    match err {
        EngineError::EmbeddingUnavailable(msg) => assert!(msg.contains("401")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_ollama_embeddings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "embed-small", "input": ["a", "b"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]
        })))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(&embedding_config("ollama", server.uri())).unwrap();
    let vectors = provider
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[1], vec![0.0, 0.0, 1.0]);
}

#[tokio::test]
async fn test_openai_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "llama-3.1-8b-instant",
            "temperature": 0.0,
            "messages": [{ "role": "system" }, { "role": "user", "content": "how many orders?" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "SELECT COUNT(*) FROM orders" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let generator =
        OpenAiGenerator::with_api_key(&generation_config("openai", server.uri()), "test-key")
            .unwrap();
    let request = sql_request("how many orders?", &[], &SchemaSnapshot::empty(), &[]);
    let reply = generator.generate(&request).await.unwrap();
    assert_eq!(reply, "SELECT COUNT(*) FROM orders");
}

#[tokio::test]
async fn test_openai_chat_error_is_generation_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let generator =
        OpenAiGenerator::with_api_key(&generation_config("openai", server.uri()), "k").unwrap();
    let err = generator
        .generate(&answer_request("q", &[], &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::GenerationUnavailable(_)));
}

#[tokio::test]
async fn test_ollama_chat() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({ "stream": false, "options": { "num_predict": 300 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "assistant", "content": "Ada bought a lamp." }
        })))
        .mount(&server)
        .await;

    let generator = OllamaGenerator::new(&generation_config("ollama", server.uri())).unwrap();
    let reply = generator
        .generate(&answer_request("what did Ada buy?", &[], &[]))
        .await
        .unwrap();
    assert_eq!(reply, "Ada bought a lamp.");
}
