//! # Modelos de Demonstração
//!
//! Pequenos modelos prontos para a interface web e para testes: uma cadeia
//! (árvore, BP exato), um ciclo (BP aproximado) e uma estrela com números de
//! estados diferentes por nó.

use ndarray::{Array2, Array3};

use crate::error::Result;
use crate::graph::Graph;
use crate::potentials::Potentials;

/// Modelo nomeado com estrutura e potenciais fixos.
#[derive(Debug, Clone)]
pub struct DemoModel {
    pub name: &'static str,
    pub description: &'static str,
    pub graph: Graph,
    pub potentials: Potentials<f64>,
}

/// Potencial de aresta que favorece estados iguais (`coupling`) nos estados válidos.
fn attractive(graph: &Graph, coupling: f64) -> Array3<f64> {
    let mut edge = graph.edge_buffer();
    for (e, &(n1, n2)) in graph.edge_ends().iter().enumerate() {
        for s1 in 0..graph.n_states(n1) {
            for s2 in 0..graph.n_states(n2) {
                edge[[e, s1, s2]] = if s1 == s2 { coupling } else { 1.0 };
            }
        }
    }
    edge
}

fn chain() -> Result<DemoModel> {
    let graph = Graph::new(vec![2; 5], vec![(0, 1), (1, 2), (2, 3), (3, 4)])?;
    let node = Array2::from_shape_vec(
        (5, 2),
        vec![3.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0],
    )?;
    let edge = attractive(&graph, 2.0);
    Ok(DemoModel {
        name: "Cadeia",
        description: "Cadeia de 5 nós binários com acoplamento atrativo; BP é exato.",
        graph,
        potentials: Potentials { node, edge },
    })
}

fn cycle() -> Result<DemoModel> {
    let graph = Graph::new(vec![3; 4], vec![(0, 1), (1, 2), (2, 3), (3, 0)])?;
    let node = Array2::from_shape_vec(
        (4, 3),
        vec![2.0, 1.0, 1.0, 1.0, 1.5, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.5],
    )?;
    let edge = attractive(&graph, 1.8);
    Ok(DemoModel {
        name: "Ciclo",
        description: "Ciclo de 4 nós com 3 estados; BP loopy aproximado.",
        graph,
        potentials: Potentials { node, edge },
    })
}

fn star() -> Result<DemoModel> {
    let graph = Graph::new(vec![3, 2, 2, 3, 2], vec![(0, 1), (0, 2), (3, 0), (0, 4)])?;
    let mut node = graph.node_buffer();
    for n in 0..graph.n_nodes() {
        for s in 0..graph.n_states(n) {
            node[[n, s]] = 1.0 + 0.5 * ((n + s) % 3) as f64;
        }
    }
    let edge = attractive(&graph, 1.5);
    Ok(DemoModel {
        name: "Estrela",
        description: "Nó central com 4 folhas e estados heterogêneos (2 e 3).",
        graph,
        potentials: Potentials { node, edge },
    })
}

/// Todos os modelos de demonstração.
pub fn demo_models() -> Result<Vec<DemoModel>> {
    Ok(vec![chain()?, cycle()?, star()?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::{infer, BpConfig};
    use crate::exact;

    #[test]
    fn test_demo_models_build() {
        let models = demo_models().unwrap();
        assert_eq!(models.len(), 3);
        for model in &models {
            assert_eq!(model.potentials.node.nrows(), model.graph.n_nodes());
            assert_eq!(model.potentials.edge.shape()[0], model.graph.n_edges());
        }
    }

    #[test]
    fn test_tree_demos_are_exact() {
        for model in demo_models().unwrap() {
            if model.name == "Ciclo" {
                continue;
            }
            let (g, p) = (&model.graph, &model.potentials);
            let result = infer(g, p, &BpConfig::default()).unwrap();
            let exact = exact::log_partition(g, p.node.view(), p.edge.view()).unwrap();
            assert!((result.log_z - exact).abs() < 1e-6, "{}", model.name);
        }
    }

    #[test]
    fn test_cycle_demo_converges() {
        let models = demo_models().unwrap();
        let model = models.iter().find(|m| m.name == "Ciclo").unwrap();
        let result = infer(&model.graph, &model.potentials, &BpConfig::default()).unwrap();
        assert!(result.convergence.converged);
        let exact =
            exact::log_partition(&model.graph, model.potentials.node.view(), model.potentials.edge.view())
                .unwrap();
        assert!((result.log_z - exact).abs() < 0.5);
    }
}
