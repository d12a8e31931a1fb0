//! # gm-core — Modelos Gráficos Discretos Pareados (MRF/CRF)
//!
//! Motor de inferência e aprendizado para campos aleatórios de Markov e
//! condicionais com variáveis discretas e fatores de no máximo duas variáveis.
//!
//! ## Arquitetura
//!
//! 1.  **Estrutura** ([`graph`]): número de estados por nó, extremidades das
//!     arestas e adjacência compacta (CSR).
//! 2.  **Potenciais** ([`potentials`]): modelo log-linear `exp(Σ w · x)` com
//!     pesos compartilhados via mapas de features 1-based.
//! 3.  **Avaliação** ([`evaluator`]): potencial e log-potencial de uma
//!     configuração completa, produto-máximo matriz-vetor.
//! 4.  **Inferência** ([`bp`]): belief propagation loopy (sum-product ou
//!     max-product), crenças de nós e arestas e `log Z` de Bethe.
//! 5.  **Aprendizado** ([`gradient`], [`crf`]): gradiente da log-verossimilhança
//!     negativa e treino por SGD com L2.
//! 6.  **Referência** ([`exact`]): enumeração exaustiva para grafos pequenos.
//!
//! Todo o motor é genérico sobre [`Real`] (`f32` e `f64`).
//!
//! ## Exemplo de Uso
//!
//! ```rust
//! use gm_core::{BpConfig, Graph, InferencePipeline, Potentials};
//! use ndarray::array;
//!
//! // Dois nós binários ligados por uma aresta
//! let graph = Graph::new(vec![2, 2], vec![(0, 1)]).unwrap();
//! let pots = Potentials {
//!     node: array![[1.0, 2.0], [1.0, 1.0]],
//!     edge: array![[[2.0, 1.0], [1.0, 2.0]]],
//! };
//!
//! let report = InferencePipeline::new(BpConfig::default()).run(&graph, &pots).unwrap();
//! println!("log Z = {:.4}, MAP = {:?}", report.log_z, report.decoded);
//! ```

pub mod bp;
pub mod crf;
pub mod demo;
pub mod error;
pub mod evaluator;
pub mod exact;
pub mod gradient;
pub mod graph;
pub mod pipeline;
pub mod potentials;
pub mod real;

pub use bp::{Beliefs, BpConfig, Convergence, Inference, ProductMode};
pub use crf::{CrfModel, CrfSample, TrainConfig};
pub use error::{GmError, Result, Stage};
pub use graph::{Adjacency, Graph};
pub use pipeline::{InferenceEvent, InferencePipeline, InferenceReport};
pub use potentials::{Features, Potentials};
pub use real::Real;
