//! # Grafo e Adjacência Compacta (CSR)
//!
//! O grafo é representado como um conjunto de arrays planos, nunca como objetos
//! ligados por ponteiros:
//!
//! ```text
//! offsets: [0, 1, 3, 4]          (n_nodes + 1 entradas)
//! edges:   [0, 0, 1, 1]          (arestas incidentes, nó a nó)
//!
//! edges_of(n) = edges[offsets[n] .. offsets[n + 1]]
//! ```
//!
//! Acessar as arestas de um nó custa `O(1)` para achar o início e `O(grau)` para
//! percorrê-las — o mesmo layout de uma matriz esparsa CSR.
//!
//! ## Orientação das arestas
//!
//! A aresta `e = (n1, n2)` é ordenada: ela define dois slots de mensagem,
//! `e` para `n1 → n2` e `e + n_edges` para `n2 → n1`.

use ndarray::{Array2, Array3};
use serde::Serialize;

use crate::error::{GmError, Result};
use crate::real::Real;

/// Mapa compacto nó → arestas incidentes.
///
/// Invariante: cada aresta aparece exatamente nas listas das suas duas extremidades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adjacency {
    offsets: Vec<usize>,
    edges: Vec<usize>,
}

impl Adjacency {
    /// Constrói a adjacência a partir das extremidades das arestas.
    ///
    /// Dentro de cada nó as arestas ficam na ordem crescente de índice
    /// (contagem + prefix sum, estável).
    pub fn from_edge_ends(n_nodes: usize, edge_ends: &[(usize, usize)]) -> Result<Self> {
        let mut degree = vec![0usize; n_nodes];
        for (e, &(n1, n2)) in edge_ends.iter().enumerate() {
            check_endpoints(e, n1, n2, n_nodes)?;
            degree[n1] += 1;
            degree[n2] += 1;
        }

        let mut offsets = Vec::with_capacity(n_nodes + 1);
        offsets.push(0);
        for d in &degree {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + d);
        }

        let mut cursor = offsets[..n_nodes].to_vec();
        let mut edges = vec![0usize; offsets[n_nodes]];
        for (e, &(n1, n2)) in edge_ends.iter().enumerate() {
            edges[cursor[n1]] = e;
            cursor[n1] += 1;
            edges[cursor[n2]] = e;
            cursor[n2] += 1;
        }

        Ok(Self { offsets, edges })
    }

    /// Aceita uma adjacência pronta (ex: vinda de outro sistema), validando o
    /// layout CSR e a invariante de incidência contra `edge_ends`.
    pub fn from_raw(
        offsets: Vec<usize>,
        edges: Vec<usize>,
        edge_ends: &[(usize, usize)],
    ) -> Result<Self> {
        if offsets.is_empty() || offsets[0] != 0 {
            return Err(GmError::InvalidGraph("offsets must start at 0".into()));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(GmError::InvalidGraph("offsets must be non-decreasing".into()));
        }
        if offsets[offsets.len() - 1] != edges.len() {
            return Err(GmError::InvalidGraph(format!(
                "last offset {} does not match {} edge entries",
                offsets[offsets.len() - 1],
                edges.len()
            )));
        }

        check_incidence(&offsets, &edges, edge_ends)?;
        Ok(Self { offsets, edges })
    }

    /// Arestas incidentes ao nó `node`, na ordem de construção
    #[inline]
    pub fn edges_of(&self, node: usize) -> &[usize] {
        &self.edges[self.offsets[node]..self.offsets[node + 1]]
    }

    #[inline]
    pub fn degree(&self, node: usize) -> usize {
        self.offsets[node + 1] - self.offsets[node]
    }

    pub fn n_nodes(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn edge_indices(&self) -> &[usize] {
        &self.edges
    }
}

/// Cada aresta aparece exatamente uma vez na lista de cada extremidade, e em
/// nenhuma outra.
fn check_incidence(offsets: &[usize], edges: &[usize], edge_ends: &[(usize, usize)]) -> Result<()> {
    let n_nodes = offsets.len() - 1;
    // (visto em n1, visto em n2) por aresta
    let mut seen = vec![(false, false); edge_ends.len()];
    for n in 0..n_nodes {
        for &e in &edges[offsets[n]..offsets[n + 1]] {
            let &(n1, n2) = edge_ends.get(e).ok_or_else(|| {
                GmError::InvalidGraph(format!("edge {e} listed at node {n} does not exist"))
            })?;
            check_endpoints(e, n1, n2, n_nodes)?;
            let slot = if n == n1 {
                &mut seen[e].0
            } else if n == n2 {
                &mut seen[e].1
            } else {
                return Err(GmError::InvalidGraph(format!(
                    "edge {e} listed at node {n}, which is not one of its endpoints"
                )));
            };
            if *slot {
                return Err(GmError::InvalidGraph(format!(
                    "edge {e} listed twice at node {n}"
                )));
            }
            *slot = true;
        }
    }
    if let Some(e) = seen.iter().position(|&(a, b)| !(a && b)) {
        return Err(GmError::InvalidGraph(format!(
            "edge {e} missing from an endpoint's adjacency list"
        )));
    }
    Ok(())
}

fn check_endpoints(e: usize, n1: usize, n2: usize, n_nodes: usize) -> Result<()> {
    if n1 >= n_nodes || n2 >= n_nodes {
        return Err(GmError::InvalidGraph(format!(
            "edge {e} = ({n1}, {n2}) references a node outside 0..{n_nodes}"
        )));
    }
    if n1 == n2 {
        return Err(GmError::InvalidGraph(format!("edge {e} is a self-loop on node {n1}")));
    }
    Ok(())
}

/// Estrutura imutável de um modelo gráfico pareado.
///
/// Agrupa a cardinalidade de cada nó, as extremidades das arestas e a
/// adjacência CSR. É construída uma vez por estrutura de grafo e reutilizada em
/// todas as chamadas de inferência e treino.
#[derive(Debug, Clone, Serialize)]
pub struct Graph {
    n_states: Vec<usize>,
    edge_ends: Vec<(usize, usize)>,
    adjacency: Adjacency,
    max_states: usize,
}

impl Graph {
    /// Cria o grafo construindo a adjacência a partir de `edge_ends`.
    pub fn new(n_states: Vec<usize>, edge_ends: Vec<(usize, usize)>) -> Result<Self> {
        let adjacency = Adjacency::from_edge_ends(n_states.len(), &edge_ends)?;
        Self::with_adjacency(n_states, edge_ends, adjacency)
    }

    /// Cria o grafo com uma adjacência fornecida pelo chamador.
    pub fn with_adjacency(
        n_states: Vec<usize>,
        edge_ends: Vec<(usize, usize)>,
        adjacency: Adjacency,
    ) -> Result<Self> {
        if let Some(n) = n_states.iter().position(|&s| s == 0) {
            return Err(GmError::InvalidGraph(format!("node {n} has zero states")));
        }
        if adjacency.n_nodes() != n_states.len() {
            return Err(GmError::InvalidGraph(format!(
                "adjacency covers {} nodes, n_states has {}",
                adjacency.n_nodes(),
                n_states.len()
            )));
        }
        for (e, &(n1, n2)) in edge_ends.iter().enumerate() {
            check_endpoints(e, n1, n2, n_states.len())?;
        }
        check_incidence(adjacency.offsets(), adjacency.edge_indices(), &edge_ends)?;
        let max_states = n_states.iter().copied().max().unwrap_or(0);

        Ok(Self {
            n_states,
            edge_ends,
            adjacency,
            max_states,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.n_states.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edge_ends.len()
    }

    /// Número de estados do nó `node`
    #[inline]
    pub fn n_states(&self, node: usize) -> usize {
        self.n_states[node]
    }

    pub fn states(&self) -> &[usize] {
        &self.n_states
    }

    /// Maior cardinalidade entre os nós (largura do padding dos buffers)
    pub fn max_states(&self) -> usize {
        self.max_states
    }

    pub fn edge_ends(&self) -> &[(usize, usize)] {
        &self.edge_ends
    }

    #[inline]
    pub fn edge(&self, e: usize) -> (usize, usize) {
        self.edge_ends[e]
    }

    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    /// Slot da mensagem que sai de `node` pela aresta `e`.
    #[inline]
    pub fn outgoing_slot(&self, e: usize, node: usize) -> usize {
        if node == self.edge_ends[e].0 {
            e
        } else {
            e + self.n_edges()
        }
    }

    /// Slot da mensagem que chega em `node` pela aresta `e`.
    #[inline]
    pub fn incoming_slot(&self, e: usize, node: usize) -> usize {
        if node == self.edge_ends[e].0 {
            e + self.n_edges()
        } else {
            e
        }
    }

    /// Vizinho de `node` do outro lado da aresta `e`
    #[inline]
    pub fn neighbor(&self, e: usize, node: usize) -> usize {
        let (n1, n2) = self.edge_ends[e];
        if node == n1 {
            n2
        } else {
            n1
        }
    }

    /// Buffer zerado `[n_nodes, max_states]` para potenciais ou crenças de nós
    pub fn node_buffer<T: Real>(&self) -> Array2<T> {
        Array2::zeros((self.n_nodes(), self.max_states))
    }

    /// Buffer zerado `[n_edges, max_states, max_states]` para arestas
    pub fn edge_buffer<T: Real>(&self) -> Array3<T> {
        Array3::zeros((self.n_edges(), self.max_states, self.max_states))
    }

    /// Buffer zerado `[2 * n_edges, max_states]` para mensagens
    pub fn message_buffer<T: Real>(&self) -> Array2<T> {
        Array2::zeros((2 * self.n_edges(), self.max_states))
    }

    /// Número total de configurações conjuntas, se couber em `usize`.
    pub fn n_configurations(&self) -> Option<usize> {
        self.n_states
            .iter()
            .try_fold(1usize, |acc, &s| acc.checked_mul(s))
    }

    /// Valida um vetor de rótulos 1-based contra as cardinalidades.
    pub fn check_labels(&self, labels: &[usize]) -> Result<()> {
        if labels.len() != self.n_nodes() {
            return Err(GmError::Shape(format!(
                "labels has length {}, graph has {} nodes",
                labels.len(),
                self.n_nodes()
            )));
        }
        for (node, (&label, &n_states)) in labels.iter().zip(&self.n_states).enumerate() {
            if label == 0 || label > n_states {
                return Err(GmError::InvalidLabel {
                    node,
                    label,
                    n_states,
                });
            }
        }
        Ok(())
    }
}

/// Confere que `shape` é `[leading, >= min_trailing[0], >= min_trailing[1], ...]`.
pub(crate) fn check_shape(
    name: &str,
    shape: &[usize],
    leading: usize,
    min_trailing: &[usize],
) -> Result<()> {
    let ok = shape.len() == 1 + min_trailing.len()
        && shape[0] == leading
        && shape[1..].iter().zip(min_trailing).all(|(&d, &m)| d >= m);
    if ok {
        Ok(())
    } else {
        Err(GmError::Shape(format!(
            "{name} has shape {shape:?}, expected [{leading}, >= {min_trailing:?}]"
        )))
    }
}
