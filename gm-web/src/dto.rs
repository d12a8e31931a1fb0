//! Conversão entre JSON aninhado e os buffers preenchidos (padded) do motor.

use gm_core::{Features, GmError, Graph, Potentials, Result};
use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// Estrutura do grafo: estados por nó e extremidades (0-based) das arestas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDto {
    pub n_states: Vec<usize>,
    pub edges: Vec<(usize, usize)>,
}

impl GraphDto {
    pub fn to_graph(&self) -> Result<Graph> {
        Graph::new(self.n_states.clone(), self.edges.clone())
    }
}

/// Potenciais sem padding: `node[n][s]`, `edge[e][s1][s2]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PotentialsDto {
    pub node: Vec<Vec<f64>>,
    pub edge: Vec<Vec<Vec<f64>>>,
}

impl PotentialsDto {
    pub fn to_potentials(&self, graph: &Graph) -> Result<Potentials<f64>> {
        let mut pots = Potentials::zeros(graph);
        pots.node = node_table(graph, &self.node, "node potentials")?;
        pots.edge = edge_table(graph, &self.edge, "edge potentials")?;
        Ok(pots)
    }

    pub fn from_potentials(graph: &Graph, pots: &Potentials<f64>) -> Self {
        Self {
            node: (0..graph.n_nodes())
                .map(|n| pots.node.row(n).iter().take(graph.n_states(n)).copied().collect())
                .collect(),
            edge: graph
                .edge_ends()
                .iter()
                .enumerate()
                .map(|(e, &(n1, n2))| {
                    (0..graph.n_states(n1))
                        .map(|s1| (0..graph.n_states(n2)).map(|s2| pots.edge[[e, s1, s2]]).collect())
                        .collect()
                })
                .collect(),
        }
    }
}

/// Features e mapas: `node[f][n]`, `edge[f][e]`, `node_map[n][s][f]`,
/// `edge_map[e][s1][s2][f]`. Entradas ausentes dos mapas valem 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesDto {
    pub node: Vec<Vec<f64>>,
    #[serde(default)]
    pub edge: Vec<Vec<f64>>,
    pub node_map: Vec<Vec<Vec<usize>>>,
    #[serde(default)]
    pub edge_map: Vec<Vec<Vec<Vec<usize>>>>,
}

impl FeaturesDto {
    pub fn to_features(&self, graph: &Graph) -> Result<Features<f64>> {
        let n_node_features = self.node.len();
        let n_edge_features = self.edge.len();
        let m = graph.max_states();

        let node = feature_matrix(&self.node, graph.n_nodes(), "node features")?;
        let edge = feature_matrix(&self.edge, graph.n_edges(), "edge features")?;

        let mut node_map = Array3::zeros((graph.n_nodes(), m, n_node_features));
        expect_len("node map", self.node_map.len(), graph.n_nodes())?;
        for (n, states) in self.node_map.iter().enumerate() {
            fits("node map states", states.len(), graph.n_states(n))?;
            for (s, feats) in states.iter().enumerate() {
                fits("node map features", feats.len(), n_node_features)?;
                for (f, &index) in feats.iter().enumerate() {
                    node_map[[n, s, f]] = index;
                }
            }
        }

        let mut edge_map = Array4::zeros((graph.n_edges(), m, m, n_edge_features));
        if !self.edge_map.is_empty() {
            expect_len("edge map", self.edge_map.len(), graph.n_edges())?;
        }
        for (e, rows) in self.edge_map.iter().enumerate() {
            let (n1, n2) = graph.edge(e);
            fits("edge map rows", rows.len(), graph.n_states(n1))?;
            for (s1, cols) in rows.iter().enumerate() {
                fits("edge map columns", cols.len(), graph.n_states(n2))?;
                for (s2, feats) in cols.iter().enumerate() {
                    fits("edge map features", feats.len(), n_edge_features)?;
                    for (f, &index) in feats.iter().enumerate() {
                        edge_map[[e, s1, s2, f]] = index;
                    }
                }
            }
        }

        let features = Features {
            node,
            edge,
            node_map,
            edge_map,
        };
        features.validate(graph)?;
        Ok(features)
    }
}

/// `[n_nodes, max_states]` a partir de linhas com exatamente `n_states[n]` valores.
pub fn node_table(graph: &Graph, rows: &[Vec<f64>], name: &str) -> Result<Array2<f64>> {
    expect_len(name, rows.len(), graph.n_nodes())?;
    let mut out = graph.node_buffer();
    for (n, row) in rows.iter().enumerate() {
        expect_len(name, row.len(), graph.n_states(n))?;
        for (s, &value) in row.iter().enumerate() {
            out[[n, s]] = value;
        }
    }
    Ok(out)
}

/// `[n_edges, max_states, max_states]` a partir de tabelas `n_states[n1] x n_states[n2]`.
pub fn edge_table(graph: &Graph, tables: &[Vec<Vec<f64>>], name: &str) -> Result<Array3<f64>> {
    expect_len(name, tables.len(), graph.n_edges())?;
    let mut out = graph.edge_buffer();
    for (e, table) in tables.iter().enumerate() {
        let (n1, n2) = graph.edge(e);
        expect_len(name, table.len(), graph.n_states(n1))?;
        for (s1, row) in table.iter().enumerate() {
            expect_len(name, row.len(), graph.n_states(n2))?;
            for (s2, &value) in row.iter().enumerate() {
                out[[e, s1, s2]] = value;
            }
        }
    }
    Ok(out)
}

/// Matriz retangular `[linhas, colunas]`.
pub fn matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let n_cols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|row| row.len() != n_cols) {
        return Err(GmError::Shape("matrix rows have different lengths".into()));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Ok(Array2::from_shape_vec((rows.len(), n_cols), flat)?)
}

/// Tamanho do vetor de gradiente: o pedido pelo cliente, limitado ao que os
/// mapas de features realmente referenciam.
pub fn gradient_len(requested: Option<usize>, referenced: usize) -> Result<usize> {
    match requested {
        None => Ok(referenced),
        Some(n) if n <= referenced => Ok(n),
        Some(n) => Err(GmError::Shape(format!(
            "n_weights {n} exceeds the {referenced} weights referenced by the feature maps"
        ))),
    }
}

fn feature_matrix(rows: &[Vec<f64>], n_items: usize, name: &str) -> Result<Array2<f64>> {
    for row in rows {
        expect_len(name, row.len(), n_items)?;
    }
    if rows.is_empty() {
        return Ok(Array2::zeros((0, n_items)));
    }
    matrix(rows)
}

fn expect_len(name: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(GmError::Shape(format!("{name}: expected {expected} entries, got {got}")));
    }
    Ok(())
}

fn fits(name: &str, got: usize, limit: usize) -> Result<()> {
    if got > limit {
        return Err(GmError::Shape(format!("{name}: at most {limit} entries, got {got}")));
    }
    Ok(())
}
