//! # CRF — Conditional Random Field sobre Grafos Arbitrários
//!
//! Junta as peças do motor num modelo treinável:
//!
//! ```text
//! pesos ──► potenciais (log-lineares) ──► belief propagation ──► crenças, log Z
//!                                                                   │
//! rótulos verdadeiros ─────────────────────────────────────────────►┴──► NLL, gradiente
//! ```
//!
//! A log-verossimilhança negativa de um exemplo rotulado é
//!
//! ```text
//! NLL(w) = log Z(w) - log P̃(Y; w)
//! ```
//!
//! com `log Z` estimado pela energia livre de Bethe. O gradiente é
//! `E_modelo[f] - f(Y)`, acumulado por [`grad_wrt_nodes`] e [`grad_wrt_edges`].
//! Em árvores (cadeias lineares inclusive) ambos são exatos.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bp::{infer, BpConfig, Inference, ProductMode};
use crate::error::{GmError, Result};
use crate::evaluator::log_potential_of;
use crate::gradient::{grad_wrt_edges, grad_wrt_nodes};
use crate::graph::Graph;
use crate::potentials::{Features, Potentials};
use crate::real::Real;

/// Um exemplo de treino: estrutura, features observadas e rótulos (1-based).
#[derive(Debug, Clone)]
pub struct CrfSample<T> {
    pub graph: Graph,
    pub features: Features<T>,
    pub labels: Vec<usize>,
}

/// Hiperparâmetros do treino por gradiente descendente estocástico.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Número de épocas (passadas completas pelos exemplos)
    pub iterations: usize,
    /// Taxa de aprendizado η
    pub learning_rate: f64,
    /// Regularização L2 λ
    pub lambda: f64,
    /// Configuração da inferência usada em cada passo
    pub bp: BpConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            iterations: 20,
            learning_rate: 0.1,
            lambda: 0.0,
            bp: BpConfig::default(),
        }
    }
}

/// Modelo CRF: apenas o vetor de pesos compartilhado por todos os exemplos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrfModel<T> {
    pub weights: Vec<T>,
}

impl<T: Real> CrfModel<T> {
    /// Modelo com `n_weights` pesos zerados
    pub fn new(n_weights: usize) -> Self {
        Self {
            weights: vec![T::zero(); n_weights],
        }
    }

    pub fn from_weights(weights: Vec<T>) -> Self {
        Self { weights }
    }

    /// Potenciais de nós e arestas para um grafo com estas features
    pub fn potentials(&self, graph: &Graph, features: &Features<T>) -> Result<Potentials<T>> {
        Potentials::build(graph, features, &self.weights)
    }

    /// Inferência sum-product completa (crenças marginais + `log Z`)
    pub fn infer(&self, graph: &Graph, features: &Features<T>, config: &BpConfig) -> Result<Inference<T>> {
        let pots = self.potentials(graph, features)?;
        infer(graph, &pots, config)
    }

    /// Rótulos mais prováveis (1-based) via max-product.
    pub fn predict(&self, graph: &Graph, features: &Features<T>, config: &BpConfig) -> Result<Vec<usize>> {
        let config = BpConfig {
            mode: ProductMode::MaxProduct,
            ..config.clone()
        };
        let result = self.infer(graph, features, &config)?;
        crate::bp::decode(graph, result.beliefs.node.view())
    }

    /// `log Z - log P̃(Y)` para um exemplo rotulado.
    pub fn negative_log_likelihood(&self, sample: &CrfSample<T>, config: &BpConfig) -> Result<f64> {
        let pots = self.potentials(&sample.graph, &sample.features)?;
        let result = infer(&sample.graph, &pots, config)?;
        let log_pot =
            log_potential_of(&sample.graph, pots.node.view(), pots.edge.view(), &sample.labels)?;
        Ok(result.log_z - log_pot)
    }

    /// Calcula a NLL e **soma** o seu gradiente em `grad`.
    pub fn nll_and_gradient(
        &self,
        sample: &CrfSample<T>,
        config: &BpConfig,
        grad: &mut [T],
    ) -> Result<f64> {
        if grad.len() != self.weights.len() {
            return Err(GmError::Shape(format!(
                "gradient has length {}, model has {} weights",
                grad.len(),
                self.weights.len()
            )));
        }
        let graph = &sample.graph;
        let feats = &sample.features;

        let pots = self.potentials(graph, feats)?;
        let result = infer(graph, &pots, config)?;
        let log_pot = log_potential_of(graph, pots.node.view(), pots.edge.view(), &sample.labels)?;

        grad_wrt_nodes(
            graph,
            feats.node.view(),
            feats.node_map.view(),
            &sample.labels,
            result.beliefs.node.view(),
            grad,
        )?;
        grad_wrt_edges(
            graph,
            feats.edge.view(),
            feats.edge_map.view(),
            &sample.labels,
            result.beliefs.edge.view(),
            grad,
        )?;

        debug!(
            iterations = result.convergence.iterations,
            log_z = result.log_z,
            "gradiente de exemplo calculado"
        );
        Ok(result.log_z - log_pot)
    }

    /// Treina o modelo com **Stochastic Gradient Descent** e regularização L2.
    ///
    /// Para cada exemplo: `w ← w - η · (∇NLL + λ · w)`.
    ///
    /// Retorna a NLL total de cada época (somada antes de cada atualização).
    pub fn train(&mut self, samples: &[CrfSample<T>], config: &TrainConfig) -> Result<Vec<f64>> {
        let mut history = Vec::with_capacity(config.iterations);
        let mut grad = vec![T::zero(); self.weights.len()];

        for epoch in 0..config.iterations {
            let mut total = 0.0f64;
            for sample in samples {
                grad.iter_mut().for_each(|g| *g = T::zero());
                total += self.nll_and_gradient(sample, &config.bp, &mut grad)?;

                for (w, g) in self.weights.iter_mut().zip(&grad) {
                    let step = g.to_acc() + config.lambda * w.to_acc();
                    *w = T::from_acc(w.to_acc() - config.learning_rate * step);
                }
            }
            if epoch % 5 == 0 {
                info!(epoch, nll = total, "época de treino do CRF");
            }
            history.push(total);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, Array4};

    /// Cadeia de 4 nós binários: bias por estado + feature observada, e pesos
    /// de transição compartilhados por todas as arestas.
    fn chain_sample() -> CrfSample<f64> {
        let n = 4;
        let graph = Graph::new(vec![2; n], vec![(0, 1), (1, 2), (2, 3)]).unwrap();
        let obs = [1.0, 0.8, -0.6, -1.0];

        let node = Array2::from_shape_fn((2, n), |(f, i)| if f == 0 { 1.0 } else { obs[i] });
        // w1, w2 = bias dos estados; w3, w4 = feature observada por estado
        let node_map = Array3::from_shape_fn((n, 2, 2), |(_, s, f)| 1 + 2 * f + s);
        let edge = Array2::from_elem((1, n - 1), 1.0);
        // w5..w8 = tabela de transição 2x2
        let edge_map = Array4::from_shape_fn((n - 1, 2, 2, 1), |(_, s1, s2, _)| 5 + 2 * s1 + s2);

        CrfSample {
            graph,
            features: Features {
                node,
                edge,
                node_map,
                edge_map,
            },
            labels: vec![2, 2, 1, 1],
        }
    }

    #[test]
    fn test_zero_weights_nll_is_log_of_configuration_count() {
        let sample = chain_sample();
        let model = CrfModel::<f64>::new(sample.features.n_weights());
        // todos os potenciais valem 1: Z = 2^4, log P̃(Y) = 0
        let nll = model.negative_log_likelihood(&sample, &BpConfig::default()).unwrap();
        assert!((nll - 16.0f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let sample = chain_sample();
        let config = BpConfig {
            tolerance: 1e-12,
            ..BpConfig::default()
        };
        let weights = vec![0.1, -0.2, 0.3, 0.05, 0.4, -0.1, 0.0, 0.2];
        let model = CrfModel::from_weights(weights.clone());

        let mut grad = vec![0.0; weights.len()];
        model.nll_and_gradient(&sample, &config, &mut grad).unwrap();

        let h = 1e-5;
        for i in 0..weights.len() {
            let mut plus = weights.clone();
            plus[i] += h;
            let mut minus = weights.clone();
            minus[i] -= h;
            let f_plus = CrfModel::from_weights(plus).negative_log_likelihood(&sample, &config).unwrap();
            let f_minus = CrfModel::from_weights(minus).negative_log_likelihood(&sample, &config).unwrap();
            let numeric = (f_plus - f_minus) / (2.0 * h);
            assert!(
                (numeric - grad[i]).abs() < 1e-4,
                "peso {i}: numérico {numeric} vs analítico {}",
                grad[i]
            );
        }
    }

    #[test]
    fn test_sgd_lowers_nll_and_predicts_labels() {
        let sample = chain_sample();
        let mut model = CrfModel::<f64>::new(sample.features.n_weights());
        let config = TrainConfig {
            iterations: 30,
            learning_rate: 0.2,
            lambda: 0.001,
            bp: BpConfig::default(),
        };
        let history = model.train(std::slice::from_ref(&sample), &config).unwrap();
        assert_eq!(history.len(), 30);
        assert!(history[29] < history[0]);

        let predicted = model
            .predict(&sample.graph, &sample.features, &BpConfig::default())
            .unwrap();
        assert_eq!(predicted, sample.labels);
    }

    #[test]
    fn test_gradient_length_mismatch() {
        let sample = chain_sample();
        let model = CrfModel::<f64>::new(8);
        let mut grad = vec![0.0; 3];
        assert!(matches!(
            model.nll_and_gradient(&sample, &BpConfig::default(), &mut grad),
            Err(GmError::Shape(_))
        ));
    }

    #[test]
    fn test_train_config_defaults() {
        let config: TrainConfig = serde_json::from_str(r#"{"learning_rate": 0.5}"#).unwrap();
        assert_eq!(config.iterations, 20);
        assert_eq!(config.learning_rate, 0.5);
        assert_eq!(config.bp.max_iterations, 100);
    }
}
