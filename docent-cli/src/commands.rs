//! CLI subcommand handlers.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use docent_core::classifier::ClassificationOutcome;
use docent_core::config::{DocentConfig, load_config};
use docent_core::providers::memory::index_directory;
use docent_core::providers::{
    CompletionProvider, EmbeddingProvider, HashEmbedder, InMemoryDocumentStore,
    InMemoryVectorBackend, OpenAiCompatibleProvider, OpenAiEmbedder, StreamEvent,
};
use docent_core::translation::{
    GlossaryLock, GlossaryTranslator, ProcessTranslator, TranslationEvent, TranslationService,
};
use docent_core::types::{Answer, CorpusHandle, Language, Query};
use docent_core::{QueryClassifier, QueryPipeline, QueryRequest};

use crate::{Commands, ConfigAction};

const COLLECTION: &str = "cli";

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            question,
            docs,
            conversation,
            lang,
            stream,
            json,
        } => {
            handle_ask(
                workspace,
                AskOptions {
                    question,
                    docs: &docs,
                    conversation,
                    lang,
                    stream,
                    json,
                },
            )
            .await
        }
        Commands::Classify { query } => handle_classify(workspace, &query).await,
        Commands::Translate {
            text,
            from,
            to,
            command,
            stream,
            no_glossary,
        } => {
            handle_translate(
                workspace,
                &text,
                &Language::from_code(&from),
                &Language::from_code(&to),
                command.as_deref(),
                stream,
                !no_glossary,
            )
            .await
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<DocentConfig> {
    load_config(Some(workspace), None).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn completion_provider(
    config: &docent_core::config::ProviderConfig,
) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    let provider = OpenAiCompatibleProvider::new(config)
        .with_context(|| format!("failed to set up provider '{}'", config.name))?;
    Ok(Arc::new(provider))
}

fn embedder(config: &DocentConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let embedding = &config.providers.embedding;
    if embedding.provider == "local" {
        return Ok(Arc::new(HashEmbedder::new(embedding.dimensions)));
    }
    Ok(Arc::new(
        OpenAiEmbedder::new(embedding).context("failed to set up embedding provider")?,
    ))
}

struct AskOptions<'a> {
    question: String,
    docs: &'a Path,
    conversation: String,
    lang: Option<String>,
    stream: bool,
    json: bool,
}

async fn handle_ask(workspace: &Path, opts: AskOptions<'_>) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let embedder = embedder(&config)?;
    let vectors = Arc::new(InMemoryVectorBackend::new());
    let documents = Arc::new(InMemoryDocumentStore::new());

    let corpus = index_directory(
        opts.docs,
        COLLECTION,
        embedder.as_ref(),
        &vectors,
        &documents,
    )
    .await
    .with_context(|| format!("failed to index {}", opts.docs.display()))?;
    if corpus.documents == 0 {
        anyhow::bail!("no .txt or .md documents found in {}", opts.docs.display());
    }
    tracing::info!(
        documents = corpus.documents,
        chunks = corpus.chunks,
        "Corpus indexed"
    );

    let mut builder = QueryPipeline::builder(config.clone())
        .primary(completion_provider(&config.providers.primary)?)
        .embedder(embedder)
        .vectors(vectors)
        .documents(documents);
    if let Some(fallback) = &config.providers.fallback {
        builder = builder.fallback(completion_provider(fallback)?);
    }
    if let Some(classifier) = &config.providers.classifier {
        builder = builder.classifier_model(completion_provider(classifier)?);
    }
    let pipeline = builder.build()?;

    let mut request = QueryRequest::new(opts.question, opts.conversation, CorpusHandle::new(COLLECTION));
    if let Some(code) = &opts.lang {
        request = request.with_language(Language::from_code(code));
    }

    let answer = if opts.stream {
        let (tx, mut rx) = mpsc::channel(64);
        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Token(token) => {
                        print!("{token}");
                        let _ = stdout.flush();
                    }
                    StreamEvent::Done => println!(),
                    StreamEvent::Error(e) => eprintln!("\n[stream interrupted: {e}]"),
                }
            }
        });
        let answer = pipeline.ask_streaming(&request, tx).await;
        printer.await?;
        answer
    } else {
        pipeline.ask(&request).await
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer, !opts.stream);
    }
    Ok(())
}

fn print_answer(answer: &Answer, with_text: bool) {
    if with_text {
        println!("{}", answer.text);
    }
    if !answer.citations.is_empty() {
        println!();
        println!("Sources:");
        for citation in &answer.citations {
            println!("  - {}, page {}", citation.document_id, citation.page);
        }
    }
    let strategy = answer
        .strategy
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".into());
    eprintln!(
        "[{:?} | strategy: {} | model: {}{}]",
        answer.state,
        strategy,
        answer.provider_used.as_deref().unwrap_or("none"),
        if answer.cached { " (cached)" } else { "" }
    );
}

async fn handle_classify(workspace: &Path, text: &str) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let mut classifier = QueryClassifier::new(config.classifier.clone());
    if let Some(provider) = &config.providers.classifier {
        classifier = classifier.with_model(completion_provider(provider)?);
    }
    let query = Query::new(text, "cli");
    match classifier.classify(&query, &[]).await {
        ClassificationOutcome::Invalid { reason } => {
            println!("{}", serde_json::json!({ "invalid": reason }));
        }
        ClassificationOutcome::Decided(decision) => {
            println!("{}", serde_json::to_string_pretty(&decision)?);
            match decision.gate_reason() {
                Some(reason) => eprintln!("[answered at the gate: {reason:?}]"),
                None => eprintln!("[proceeds to retrieval]"),
            }
        }
    }
    Ok(())
}

async fn handle_translate(
    workspace: &Path,
    text: &str,
    from: &Language,
    to: &Language,
    command: Option<&str>,
    stream: bool,
    glossary: bool,
) -> anyhow::Result<()> {
    let mut settings = load(workspace)?.translation;
    if let Some(command) = command {
        settings.command = command.split_whitespace().map(String::from).collect();
    }
    let process = ProcessTranslator::from_config(&settings)?;
    let translator: Box<dyn TranslationService> = if glossary && settings.glossary {
        Box::new(GlossaryTranslator::new(process, GlossaryLock::english_hindi()))
    } else {
        Box::new(process)
    };

    if !stream {
        println!("{}", translator.translate(text, from, to).await?);
        return Ok(());
    }

    let mut rx = translator.translate_stream(text, from, to).await?;
    while let Some(event) = rx.recv().await {
        match event {
            TranslationEvent::Chunk { index, total, text } => {
                println!("[{}/{}] {}", index + 1, total, text);
            }
            TranslationEvent::Complete { text } => {
                println!();
                println!("{text}");
                return Ok(());
            }
            TranslationEvent::Error { message } => anyhow::bail!("translation failed: {message}"),
        }
    }
    anyhow::bail!("translator stream ended before completing")
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".docent");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&DocentConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
