//! Tipos de erro do motor de modelos gráficos.

use thiserror::Error;

/// Etapa do algoritmo em que uma normalização encontrou soma zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Messages,
    NodeBeliefs,
    EdgeBeliefs,
}

impl Stage {
    /// Nome legível da etapa (usado nas mensagens de erro)
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Messages => "messages",
            Stage::NodeBeliefs => "node beliefs",
            Stage::EdgeBeliefs => "edge beliefs",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Erros que podem ocorrer durante a construção de potenciais, inferência ou
/// cálculo de gradientes.
///
/// Marcado `#[non_exhaustive]` para permitir novas variantes sem quebrar quem
/// faz `match`.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GmError {
    /// Uma soma de normalização deu exatamente zero: os potenciais colapsaram
    /// para valores numericamente insustentáveis. Fatal para a chamada atual.
    #[error("numeric precision too low, can't compute {stage}")]
    PrecisionExhausted { stage: Stage },

    /// Dimensões de arrays incompatíveis entre si.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Vetor plano incompatível com a forma pedida ao montar um array.
    #[error("array construction failed: {0}")]
    Array(#[from] ndarray::ShapeError),

    /// Rótulo fora do intervalo `1..=n_states` do nó.
    #[error("label {label} out of range for node {node} with {n_states} states")]
    InvalidLabel {
        node: usize,
        label: usize,
        n_states: usize,
    },

    /// Mapa de features aponta para um slot de peso inexistente.
    #[error("feature map index {index} references a weight vector of length {n_weights}")]
    InvalidFeatureIndex { index: usize, n_weights: usize },

    /// Estrutura do grafo inválida (extremidade fora do intervalo, offsets
    /// inconsistentes, nó sem estados, ...).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Enumeração exata pedida para um grafo com configurações demais.
    #[error("graph has more than {limit} joint configurations, exact enumeration refused")]
    Intractable { limit: usize },
}

/// Atalho para resultados do motor.
pub type Result<T> = std::result::Result<T, GmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_message_names_stage() {
        let err = GmError::PrecisionExhausted {
            stage: Stage::NodeBeliefs,
        };
        assert_eq!(
            err.to_string(),
            "numeric precision too low, can't compute node beliefs"
        );
    }
}
