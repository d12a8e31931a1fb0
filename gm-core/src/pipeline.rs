//! # Pipeline de Inferência — Orquestrador com Eventos Observáveis
//!
//! Coordena as etapas do belief propagation (inicialização, varreduras,
//! crenças, `log Z`, decodificação) e emite um evento a cada passo via um
//! canal `mpsc`, permitindo que o servidor WebSocket transmita o progresso
//! da convergência em tempo real.

use std::sync::mpsc;
use std::time::Instant;

use ndarray::{ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bp::{
    decode, init_messages, run_loopy_with, Beliefs, BpConfig, Convergence, ProductMode,
};
use crate::error::Result;
use crate::graph::Graph;
use crate::potentials::Potentials;
use crate::real::Real;

/// Resultado consolidado de uma inferência, pronto para serialização.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReport {
    pub mode: ProductMode,
    /// Crença de cada nó, apenas estados válidos
    pub node_beliefs: Vec<Vec<f64>>,
    /// Crença de cada aresta, `[n_states[n1]][n_states[n2]]`
    pub edge_beliefs: Vec<Vec<Vec<f64>>>,
    /// Estimativa de Bethe (significativa apenas em sum-product)
    pub log_z: f64,
    /// Rótulo de maior crença de cada nó (1-based)
    pub decoded: Vec<usize>,
    pub convergence: Convergence,
    pub processing_ms: u64,
}

/// Eventos emitidos durante a inferência.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InferenceEvent {
    /// Mensagens inicializadas com distribuições uniformes.
    MessagesInitialized {
        n_nodes: usize,
        n_edges: usize,
        max_states: usize,
    },
    /// Uma varredura assíncrona completa.
    SweepDone { iteration: usize, max_delta: f64 },
    /// Crenças finais dos nós, calculadas a partir das mensagens.
    BeliefsComputed { node_beliefs: Vec<Vec<f64>> },
    /// Conclusão com o relatório completo.
    Done(InferenceReport),
    /// Falha irrecuperável (ex.: precisão numérica esgotada).
    Error { message: String },
}

/// Pipeline de inferência com configuração fixa.
///
/// - **Sync**: [`InferencePipeline::run`]
/// - **Streaming**: [`InferencePipeline::run_streaming`] (WebSocket)
#[derive(Debug, Clone, Default)]
pub struct InferencePipeline {
    pub config: BpConfig,
}

impl InferencePipeline {
    pub fn new(config: BpConfig) -> Self {
        Self { config }
    }

    /// Executa a inferência sem observadores.
    pub fn run<T: Real>(&self, graph: &Graph, pots: &Potentials<T>) -> Result<InferenceReport> {
        let (tx, _rx) = mpsc::channel();
        self.run_streaming(graph, pots, tx)
    }

    /// Executa a inferência enviando eventos de progresso por `tx`.
    ///
    /// # Fluxo de Eventos
    /// 1. `MessagesInitialized`
    /// 2. `SweepDone` (uma por varredura)
    /// 3. `BeliefsComputed`
    /// 4. `Done` ou `Error`
    ///
    /// Um receptor desconectado não interrompe o cálculo.
    pub fn run_streaming<T: Real>(
        &self,
        graph: &Graph,
        pots: &Potentials<T>,
        tx: mpsc::Sender<InferenceEvent>,
    ) -> Result<InferenceReport> {
        let start = Instant::now();
        let result = self.stream_steps(graph, pots, &tx, start);
        if let Err(err) = &result {
            warn!(error = %err, "inferência falhou");
            let _ = tx.send(InferenceEvent::Error {
                message: err.to_string(),
            });
        }
        result
    }

    fn stream_steps<T: Real>(
        &self,
        graph: &Graph,
        pots: &Potentials<T>,
        tx: &mpsc::Sender<InferenceEvent>,
        start: Instant,
    ) -> Result<InferenceReport> {
        // === Passo 1: mensagens uniformes ===
        let mut messages = graph.message_buffer();
        init_messages(graph, &mut messages)?;
        let _ = tx.send(InferenceEvent::MessagesInitialized {
            n_nodes: graph.n_nodes(),
            n_edges: graph.n_edges(),
            max_states: graph.max_states(),
        });

        // === Passo 2: varreduras até convergir ===
        let convergence = run_loopy_with(graph, pots, &mut messages, &self.config, |iteration, max_delta| {
            let _ = tx.send(InferenceEvent::SweepDone {
                iteration,
                max_delta,
            });
        })?;

        // === Passo 3: crenças ===
        let beliefs = Beliefs::compute(graph, pots, messages.view())?;
        let node_beliefs = node_rows(graph, beliefs.node.view());
        let _ = tx.send(InferenceEvent::BeliefsComputed {
            node_beliefs: node_beliefs.clone(),
        });

        // === Passo 4: log Z e decodificação ===
        let log_z = beliefs.log_z(graph, pots)?;
        let decoded = decode(graph, beliefs.node.view())?;

        let report = InferenceReport {
            mode: self.config.mode,
            node_beliefs,
            edge_beliefs: edge_tables(graph, beliefs.edge.view()),
            log_z,
            decoded,
            convergence,
            processing_ms: start.elapsed().as_millis() as u64,
        };
        let _ = tx.send(InferenceEvent::Done(report.clone()));
        Ok(report)
    }
}

fn node_rows<T: Real>(graph: &Graph, beliefs: ArrayView2<T>) -> Vec<Vec<f64>> {
    (0..graph.n_nodes())
        .map(|n| {
            (0..graph.n_states(n))
                .map(|s| beliefs[[n, s]].to_acc())
                .collect()
        })
        .collect()
}

fn edge_tables<T: Real>(graph: &Graph, beliefs: ArrayView3<T>) -> Vec<Vec<Vec<f64>>> {
    (0..graph.n_edges())
        .map(|e| {
            let (n1, n2) = graph.edge(e);
            (0..graph.n_states(n1))
                .map(|s1| {
                    (0..graph.n_states(n2))
                        .map(|s2| beliefs[[e, s1, s2]].to_acc())
                        .collect()
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GmError;
    use ndarray::{array, Array2, Array3};

    fn pair() -> (Graph, Potentials<f64>) {
        let graph = Graph::new(vec![2, 3], vec![(0, 1)]).unwrap();
        let node = array![[1.0, 2.0, 0.0], [1.0, 1.0, 2.0]];
        let mut edge = Array3::zeros((1, 3, 3));
        edge.slice_mut(ndarray::s![0, ..2, ..3])
            .assign(&array![[2.0, 1.0, 1.0], [1.0, 1.0, 3.0]]);
        (graph, Potentials { node, edge })
    }

    #[test]
    fn test_pipeline_events_streaming() {
        let (graph, pots) = pair();
        let pipeline = InferencePipeline::default();
        let (tx, rx) = mpsc::channel();
        pipeline.run_streaming(&graph, &pots, tx).unwrap();

        let events: Vec<InferenceEvent> = rx.try_iter().collect();
        assert!(matches!(events[0], InferenceEvent::MessagesInitialized { n_edges: 1, .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, InferenceEvent::SweepDone { iteration: 1, .. })));
        let beliefs = events.iter().find_map(|e| match e {
            InferenceEvent::BeliefsComputed { node_beliefs } => Some(node_beliefs),
            _ => None,
        });
        assert_eq!(beliefs.map(Vec::len), Some(2));
        assert!(matches!(events.last(), Some(InferenceEvent::Done(_))));
    }

    #[test]
    fn test_pipeline_report_matches_exact() {
        let (graph, pots) = pair();
        let report = InferencePipeline::default().run(&graph, &pots).unwrap();

        let exact = crate::exact::log_partition(&graph, pots.node.view(), pots.edge.view()).unwrap();
        assert!((report.log_z - exact).abs() < 1e-9);
        assert!(report.convergence.converged);
        assert_eq!(report.node_beliefs[0].len(), 2);
        assert_eq!(report.node_beliefs[1].len(), 3);
        assert_eq!(report.edge_beliefs[0].len(), 2);
        assert_eq!(report.edge_beliefs[0][0].len(), 3);
        // MAP: (2, 3) com potencial 2·2·3 = 12
        let map = crate::exact::map_configuration(&graph, pots.node.view(), pots.edge.view()).unwrap();
        assert_eq!(map.0, vec![2, 3]);
    }

    #[test]
    fn test_pipeline_error_event() {
        let graph = Graph::new(vec![2, 2], vec![(0, 1)]).unwrap();
        let pots = Potentials {
            node: Array2::<f64>::ones((2, 2)),
            edge: Array3::zeros((1, 2, 2)),
        };
        let (tx, rx) = mpsc::channel();
        let result = InferencePipeline::default().run_streaming(&graph, &pots, tx);
        assert!(matches!(result, Err(GmError::PrecisionExhausted { .. })));

        let events: Vec<InferenceEvent> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(InferenceEvent::Error { .. })));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = InferenceEvent::SweepDone {
            iteration: 3,
            max_delta: 0.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SweepDone");
        assert_eq!(json["data"]["iteration"], 3);
    }
}
