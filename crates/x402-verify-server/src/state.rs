use std::sync::Arc;

use tokio::task::JoinHandle;
use x402_verify::analytics::{AnalyticsSink, DEFAULT_QUEUE_CAPACITY};
use x402_verify::http_client::{build_client, RetryPolicy};
use x402_verify::{
    AnalyticsRecorder, ChainBackend, ChainReader, ChainRegistry, FacilitatorBackend,
    FacilitatorClient, PaymentRequirement, ReplayGuard, SqliteAnalyticsSink, SqliteReplayStore,
    VerificationEngine, VerifyError,
};

use crate::config::ServerConfig;
use crate::pricing::PriceTable;

/// Shared application state, generic over the backends so tests can swap them.
pub struct AppState<C, F> {
    pub engine: VerificationEngine<C, F>,
    pub prices: PriceTable,
    pub merchant: String,
    pub chains: Arc<ChainRegistry>,
    pub metrics_token: Option<String>,
    pub public_metrics: bool,
}

pub type LiveState = AppState<ChainReader, FacilitatorClient>;

impl<C, F> AppState<C, F>
where
    C: ChainBackend,
    F: FacilitatorBackend,
{
    pub fn requirement_for(&self, path: &str) -> Option<PaymentRequirement> {
        self.prices.requirement_for(path, &self.merchant, &self.chains)
    }
}

/// Everything `main` needs to serve: the state, a facilitator handle for
/// startup diagnostics, and the analytics writer task.
pub struct LiveParts {
    pub state: LiveState,
    pub facilitator: FacilitatorClient,
    pub analytics_writer: JoinHandle<()>,
}

/// Wire the live backends, the SQLite replay store and the analytics sink.
///
/// Must be called inside a tokio runtime (the analytics writer is spawned).
pub fn build_live(config: &ServerConfig) -> Result<LiveParts, VerifyError> {
    let verifier = &config.verifier;
    let http = build_client(verifier.chain_timeout.max(verifier.facilitator_timeout))?;
    let chains = Arc::new(verifier.chains.clone());

    let chain_reader = ChainReader::from_registry(&chains, http.clone(), RetryPolicy::default())?;
    let facilitator = FacilitatorClient::new(http, verifier.facilitator_url.clone(), chains.clone())
        .with_enabled(verifier.facilitator_enabled)
        .with_shared_secret(verifier.facilitator_secret.clone());

    let replay = ReplayGuard::new(Arc::new(SqliteReplayStore::open(&verifier.db_path)?));
    let sink: Arc<dyn AnalyticsSink> = Arc::new(SqliteAnalyticsSink::open(&verifier.db_path)?);
    let (recorder, analytics_writer) = AnalyticsRecorder::spawn(vec![sink], DEFAULT_QUEUE_CAPACITY);

    let engine = VerificationEngine::new(
        chain_reader,
        facilitator.clone(),
        replay,
        verifier.engine_config(),
    )
    .with_analytics(recorder);

    Ok(LiveParts {
        state: AppState {
            engine,
            prices: config.prices.clone(),
            merchant: verifier.merchant_address.clone(),
            chains,
            metrics_token: config.metrics_token.clone(),
            public_metrics: config.public_metrics,
        },
        facilitator,
        analytics_writer,
    })
}
