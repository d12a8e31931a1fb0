//! Servidor web Axum com WebSocket para inferência em modelos gráficos em tempo real

mod dto;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use gm_core::{
    bp::BpConfig,
    demo::demo_models,
    evaluator::{log_potential_of, max_product, potential_of},
    gradient::{grad_wrt_edges, grad_wrt_nodes},
    pipeline::{InferenceEvent, InferencePipeline, InferenceReport},
    GmError, Potentials,
};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use dto::{edge_table, gradient_len, matrix, node_table, FeaturesDto, GraphDto, PotentialsDto};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Estado compartilhado da aplicação
struct AppState {
    default_config: BpConfig,
}

/// Erro de requisição: falhas do motor viram `400`, falhas de tarefa `500`.
enum ApiError {
    Engine(GmError),
    Internal(String),
}

impl From<GmError> for ApiError {
    fn from(err: GmError) -> Self {
        Self::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Deserialize)]
struct InferRequest {
    graph: GraphDto,
    potentials: PotentialsDto,
    #[serde(default)]
    config: Option<BpConfig>,
}

#[derive(Deserialize)]
struct PotentialsRequest {
    graph: GraphDto,
    features: FeaturesDto,
    weights: Vec<f64>,
}

#[derive(Deserialize)]
struct GradientRequest {
    graph: GraphDto,
    features: FeaturesDto,
    labels: Vec<usize>,
    node_beliefs: Vec<Vec<f64>>,
    edge_beliefs: Vec<Vec<Vec<f64>>>,
    #[serde(default)]
    n_weights: Option<usize>,
}

#[derive(Serialize)]
struct GradientResponse {
    gradient: Vec<f64>,
}

#[derive(Deserialize)]
struct EvaluateRequest {
    graph: GraphDto,
    potentials: PotentialsDto,
    labels: Vec<usize>,
}

#[derive(Serialize)]
struct EvaluateResponse {
    potential: f64,
    log_potential: f64,
}

#[derive(Deserialize)]
struct MaxProductRequest {
    matrix: Vec<Vec<f64>>,
    vector: Vec<f64>,
}

#[derive(Serialize)]
struct MaxProductResponse {
    result: Vec<f64>,
}

#[derive(Serialize)]
struct DemoModelResponse {
    name: &'static str,
    description: &'static str,
    graph: GraphDto,
    potentials: PotentialsDto,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let state = Arc::new(AppState {
        default_config: BpConfig::default(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/infer", post(infer_handler))
        .route("/potentials", post(potentials_handler))
        .route("/gradient", post(gradient_handler))
        .route("/evaluate", post(evaluate_handler))
        .route("/maxproduct", post(max_product_handler))
        .route("/demo-models", get(demo_models_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state);

    let addr = std::env::var("GM_WEB_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("falha ao abrir {addr}: {err}");
            return;
        }
    };
    info!("🚀 Servidor de modelos gráficos iniciado em http://{addr}");
    if let Err(err) = axum::serve(listener, app).await {
        error!("servidor encerrado com erro: {err}");
    }
}

fn run_inference(state: &AppState, req: &InferRequest) -> Result<InferenceReport, GmError> {
    let graph = req.graph.to_graph()?;
    let pots = req.potentials.to_potentials(&graph)?;
    let config = req.config.clone().unwrap_or_else(|| state.default_config.clone());
    InferencePipeline::new(config).run(&graph, &pots)
}

/// Inferência completa via HTTP POST (sem streaming)
async fn infer_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InferRequest>,
) -> ApiResult<InferenceReport> {
    let report = tokio::task::spawn_blocking(move || run_inference(&state, &req))
        .await
        .map_err(|err| ApiError::Internal(format!("inference task failed: {err}")))??;
    Ok(Json(report))
}

/// Potenciais log-lineares a partir de features e pesos
async fn potentials_handler(Json(req): Json<PotentialsRequest>) -> ApiResult<PotentialsDto> {
    let graph = req.graph.to_graph()?;
    let features = req.features.to_features(&graph)?;
    let pots = Potentials::build(&graph, &features, &req.weights)?;
    Ok(Json(PotentialsDto::from_potentials(&graph, &pots)))
}

/// Gradiente da NLL a partir de crenças já calculadas
async fn gradient_handler(Json(req): Json<GradientRequest>) -> ApiResult<GradientResponse> {
    let graph = req.graph.to_graph()?;
    let features = req.features.to_features(&graph)?;
    let node_beliefs = node_table(&graph, &req.node_beliefs, "node beliefs")?;
    let edge_beliefs = edge_table(&graph, &req.edge_beliefs, "edge beliefs")?;

    let mut gradient = vec![0.0; gradient_len(req.n_weights, features.n_weights())?];
    grad_wrt_nodes(
        &graph,
        features.node.view(),
        features.node_map.view(),
        &req.labels,
        node_beliefs.view(),
        &mut gradient,
    )?;
    grad_wrt_edges(
        &graph,
        features.edge.view(),
        features.edge_map.view(),
        &req.labels,
        edge_beliefs.view(),
        &mut gradient,
    )?;
    Ok(Json(GradientResponse { gradient }))
}

/// Potencial e log-potencial de uma configuração
async fn evaluate_handler(Json(req): Json<EvaluateRequest>) -> ApiResult<EvaluateResponse> {
    let graph = req.graph.to_graph()?;
    let pots = req.potentials.to_potentials(&graph)?;
    let (node, edge) = (pots.node.view(), pots.edge.view());
    Ok(Json(EvaluateResponse {
        potential: potential_of(&graph, node, edge, &req.labels)?,
        log_potential: log_potential_of(&graph, node, edge, &req.labels)?,
    }))
}

/// Produto-máximo matriz-vetor
async fn max_product_handler(Json(req): Json<MaxProductRequest>) -> ApiResult<MaxProductResponse> {
    let m = matrix(&req.matrix)?;
    let v = Array1::from_vec(req.vector);
    let result = max_product(m.view(), v.view())?;
    Ok(Json(MaxProductResponse {
        result: result.to_vec(),
    }))
}

/// Retorna os modelos de demonstração
async fn demo_models_handler() -> ApiResult<Vec<DemoModelResponse>> {
    let models = demo_models()?
        .into_iter()
        .map(|model| DemoModelResponse {
            name: model.name,
            description: model.description,
            graph: GraphDto {
                n_states: model.graph.states().to_vec(),
                edges: model.graph.edge_ends().to_vec(),
            },
            potentials: PotentialsDto::from_potentials(&model.graph, &model.potentials),
        })
        .collect();
    Ok(Json(models))
}

/// Upgrade HTTP → WebSocket
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Lógica do WebSocket: recebe um pedido de inferência e transmite os eventos
async fn handle_websocket(mut socket: WebSocket, state: Arc<AppState>) {
    info!("WebSocket conectado");

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let events = match serde_json::from_str::<InferRequest>(&text) {
                    Ok(req) => {
                        info!(
                            nodes = req.graph.n_states.len(),
                            edges = req.graph.edges.len(),
                            "inferência via WebSocket"
                        );
                        let state = Arc::clone(&state);
                        // O pipeline é síncrono: roda fora do runtime
                        let handle = tokio::task::spawn_blocking(move || {
                            let (tx, rx) = std::sync::mpsc::channel::<InferenceEvent>();
                            let setup = req
                                .graph
                                .to_graph()
                                .and_then(|graph| Ok((req.potentials.to_potentials(&graph)?, graph)));
                            match setup {
                                Ok((pots, graph)) => {
                                    let config =
                                        req.config.unwrap_or_else(|| state.default_config.clone());
                                    let _ = InferencePipeline::new(config).run_streaming(&graph, &pots, tx);
                                }
                                Err(err) => {
                                    let _ = tx.send(InferenceEvent::Error {
                                        message: err.to_string(),
                                    });
                                }
                            }
                            rx.try_iter().collect::<Vec<_>>()
                        });
                        match handle.await {
                            Ok(events) => events,
                            Err(err) => vec![InferenceEvent::Error {
                                message: format!("inference task failed: {err}"),
                            }],
                        }
                    }
                    Err(err) => vec![InferenceEvent::Error {
                        message: format!("invalid request: {err}"),
                    }],
                };

                for event in &events {
                    if let Ok(json) = serde_json::to_string(event) {
                        if socket.send(Message::Text(json)).await.is_err() {
                            return; // cliente desconectou
                        }
                        // Pausa curta para a animação das varreduras
                        tokio::time::sleep(tokio::time::Duration::from_millis(35)).await;
                    }
                }
            }
            Message::Close(_) => {
                info!("WebSocket desconectado");
                return;
            }
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            _ => {}
        }
    }
}
