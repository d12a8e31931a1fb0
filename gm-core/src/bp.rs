//! # Belief Propagation Loopy
//!
//! Passagem de mensagens sobre um grafo pareado arbitrário (com ou sem ciclos).
//!
//! ## Mensagens
//!
//! Para cada aresta `e = (n1, n2)` existem duas mensagens normalizadas:
//!
//! ```text
//! msg[e]           : n1 → n2   (tamanho n_states[n2])
//! msg[e + n_edges] : n2 → n1   (tamanho n_states[n1])
//! ```
//!
//! ## Regra de atualização (nó `n` enviando para o vizinho `m` pela aresta `e`)
//!
//! ```text
//! prod[s]    = pot_node[n, s] · Π_{e' ∋ n, e' ≠ e} msg_{e' → n}[s]      ("excluindo a si mesmo")
//! sum-product: msg_{n → m}[t] ∝ Σ_s  pot_edge(n = s, m = t) · prod[s]
//! max-product: msg_{n → m}[t] ∝ max_s pot_edge(n = s, m = t) · prod[s]
//! ```
//!
//! ## Varredura assíncrona
//!
//! [`compute_messages`] faz **exatamente uma** varredura: nós em ordem de índice,
//! arestas na ordem da adjacência, cada mensagem escrita imediatamente
//! (estilo Gauss–Seidel — nós posteriores já enxergam as mensagens novas).
//! Convergência é responsabilidade do chamador; [`run_loopy`] é um laço pronto
//! que repete a varredura até a variação máxima cair abaixo da tolerância.
//!
//! ## Energia livre de Bethe
//!
//! [`compute_log_z`] estima `log Z` por `-F_Bethe`, exato em árvores e
//! aproximado (possivelmente enviesado) em grafos com ciclos.

use ndarray::linalg::general_mat_vec_mul;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GmError, Result, Stage};
use crate::evaluator::max_product_into;
use crate::graph::{check_shape, Graph};
use crate::potentials::Potentials;
use crate::real::Real;

/// Épsilon somado às crenças antes do `log` no cálculo de `log Z`.
pub const LOG_Z_EPSILON: f64 = 1e-15;

/// Variante da regra de mensagem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductMode {
    /// Marginais (soma de produtos = produto matriz-vetor)
    #[default]
    SumProduct,
    /// Configuração mais provável (máximo de produtos)
    MaxProduct,
}

/// Configuração do laço de convergência ([`run_loopy`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BpConfig {
    pub mode: ProductMode,
    /// Número máximo de varreduras completas
    pub max_iterations: usize,
    /// Para quando a maior variação absoluta de mensagem for `<= tolerance`
    pub tolerance: f64,
}

impl Default for BpConfig {
    fn default() -> Self {
        Self {
            mode: ProductMode::SumProduct,
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

/// Resumo de uma execução de [`run_loopy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    pub iterations: usize,
    /// Variação máxima observada na última varredura
    pub max_delta: f64,
    pub converged: bool,
}

/// Inicializa todas as mensagens com a distribuição uniforme `1 / n_states[alvo]`.
///
/// Idempotente e independente por slot (paralelo). Padding não é tocado.
pub fn init_messages<T: Real>(graph: &Graph, messages: &mut Array2<T>) -> Result<()> {
    check_messages(graph, messages.view())?;
    let n_edges = graph.n_edges();

    messages
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(slot, mut row)| {
            let target = if slot < n_edges {
                graph.edge(slot).1
            } else {
                graph.edge(slot - n_edges).0
            };
            let k = graph.n_states(target);
            row.slice_mut(s![..k]).fill(T::from_acc(1.0 / k as f64));
        });
    Ok(())
}

/// Executa **uma** varredura de atualização de mensagens, in place.
///
/// Retorna a maior variação absoluta entre a mensagem antiga e a nova
/// (útil para o critério de convergência do chamador). Uma mensagem com soma
/// zero aborta a chamada com [`GmError::PrecisionExhausted`].
pub fn compute_messages<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
    messages: &mut Array2<T>,
    mode: ProductMode,
) -> Result<f64> {
    check_potentials(graph, node_pot, edge_pot)?;
    check_messages(graph, messages.view())?;

    let adjacency = graph.adjacency();
    let mut prod = Array1::<T>::zeros(graph.max_states());
    let mut fresh = Array1::<T>::zeros(graph.max_states());
    let mut max_delta = 0.0f64;

    for n in 0..graph.n_nodes() {
        let k_n = graph.n_states(n);
        let edges = adjacency.edges_of(n);

        for &e in edges {
            let (n1, n2) = graph.edge(e);
            let m = graph.neighbor(e, n);
            let k_m = graph.n_states(m);

            // potencial conjunto orientado como [estado de m, estado de n]
            let pot = edge_pot.slice(s![e, ..graph.n_states(n1), ..graph.n_states(n2)]);
            let oriented = if n == n1 { pot.reversed_axes() } else { pot };

            // produto do potencial do nó com todas as mensagens de entrada, exceto a de e
            let mut prod_n = prod.slice_mut(s![..k_n]);
            prod_n.assign(&node_pot.slice(s![n, ..k_n]));
            for &other in edges {
                if other != e {
                    let incoming = messages.slice(s![graph.incoming_slot(other, n), ..k_n]);
                    prod_n *= &incoming;
                }
            }

            let mut out = fresh.slice_mut(s![..k_m]);
            match mode {
                ProductMode::MaxProduct => {
                    max_product_into(oriented, prod.slice(s![..k_n]), out.view_mut())
                }
                ProductMode::SumProduct => general_mat_vec_mul(
                    T::one(),
                    &oriented,
                    &prod.slice(s![..k_n]),
                    T::zero(),
                    &mut out,
                ),
            }
            normalize(out.view_mut(), Stage::Messages)?;

            let mut target = messages.slice_mut(s![graph.outgoing_slot(e, n), ..k_m]);
            for (old, &new) in target.iter_mut().zip(out.iter()) {
                max_delta = max_delta.max((new.to_acc() - old.to_acc()).abs());
                *old = new;
            }
        }
    }

    debug!(
        nodes = graph.n_nodes(),
        edges = graph.n_edges(),
        ?mode,
        max_delta,
        "varredura de mensagens concluída"
    );
    Ok(max_delta)
}

/// Repete [`compute_messages`] até convergir ou esgotar `max_iterations`.
///
/// As mensagens não são reinicializadas: o chamador decide entre
/// [`init_messages`] e um warm start com mensagens de uma chamada anterior.
pub fn run_loopy<T: Real>(
    graph: &Graph,
    pots: &Potentials<T>,
    messages: &mut Array2<T>,
    config: &BpConfig,
) -> Result<Convergence> {
    run_loopy_with(graph, pots, messages, config, |_, _| {})
}

/// Igual a [`run_loopy`], chamando `on_sweep(iteração, variação)` após cada varredura.
pub fn run_loopy_with<T: Real, F>(
    graph: &Graph,
    pots: &Potentials<T>,
    messages: &mut Array2<T>,
    config: &BpConfig,
    mut on_sweep: F,
) -> Result<Convergence>
where
    F: FnMut(usize, f64),
{
    let mut max_delta = f64::INFINITY;
    for iteration in 1..=config.max_iterations {
        max_delta = compute_messages(
            graph,
            pots.node.view(),
            pots.edge.view(),
            messages,
            config.mode,
        )?;
        on_sweep(iteration, max_delta);
        if max_delta <= config.tolerance {
            return Ok(Convergence {
                iterations: iteration,
                max_delta,
                converged: true,
            });
        }
    }

    warn!(
        max_iterations = config.max_iterations,
        max_delta, "belief propagation não convergiu"
    );
    Ok(Convergence {
        iterations: config.max_iterations,
        max_delta,
        converged: false,
    })
}

/// Crença de cada nó: potencial do nó vezes **todas** as mensagens de entrada,
/// normalizada para somar 1.
pub fn compute_node_beliefs<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    messages: ArrayView2<T>,
    beliefs: &mut Array2<T>,
) -> Result<()> {
    let m = graph.max_states();
    check_shape("node potentials", node_pot.shape(), graph.n_nodes(), &[m])?;
    check_shape("node beliefs", beliefs.shape(), graph.n_nodes(), &[m])?;
    check_messages(graph, messages)?;

    for n in 0..graph.n_nodes() {
        let k = graph.n_states(n);
        let mut belief = beliefs.slice_mut(s![n, ..k]);
        belief.assign(&node_pot.slice(s![n, ..k]));
        for &e in graph.adjacency().edges_of(n) {
            belief *= &messages.slice(s![graph.incoming_slot(e, n), ..k]);
        }
        normalize(belief, Stage::NodeBeliefs)?;
    }
    Ok(())
}

/// Crença de cada aresta `(n1, n2)`:
///
/// ```text
/// b1 = belief[n1] / msg_{n2 → n1}      (remove a contribuição desta aresta)
/// b2 = belief[n2] / msg_{n1 → n2}
/// belief[e] ∝ (b1 ⊗ b2) ⊙ pot_edge[e]
/// ```
///
/// Uma entrada de mensagem igual a zero zera a entrada correspondente de `b1`/`b2`:
/// com potenciais não negativos, essa linha (ou coluna) da crença é zero.
pub fn compute_edge_beliefs<T: Real>(
    graph: &Graph,
    edge_pot: ArrayView3<T>,
    node_beliefs: ArrayView2<T>,
    messages: ArrayView2<T>,
    beliefs: &mut Array3<T>,
) -> Result<()> {
    let m = graph.max_states();
    check_shape("edge potentials", edge_pot.shape(), graph.n_edges(), &[m, m])?;
    check_shape("edge beliefs", beliefs.shape(), graph.n_edges(), &[m, m])?;
    check_shape("node beliefs", node_beliefs.shape(), graph.n_nodes(), &[m])?;
    check_messages(graph, messages)?;

    let n_edges = graph.n_edges();
    for e in 0..n_edges {
        let (n1, n2) = graph.edge(e);
        let (k1, k2) = (graph.n_states(n1), graph.n_states(n2));

        let b1 = cavity(node_beliefs.slice(s![n1, ..k1]), messages.slice(s![e + n_edges, ..k1]));
        let b2 = cavity(node_beliefs.slice(s![n2, ..k2]), messages.slice(s![e, ..k2]));

        let mut belief = beliefs.slice_mut(s![e, ..k1, ..k2]);
        for ((s1, s2), value) in belief.indexed_iter_mut() {
            *value = b1[s1] * b2[s2] * edge_pot[[e, s1, s2]];
        }

        let sum: f64 = belief.iter().map(|v| v.to_acc()).sum();
        check_sum(sum, Stage::EdgeBeliefs)?;
        let sum = T::from_acc(sum);
        belief.mapv_inplace(|v| v / sum);
    }
    Ok(())
}

/// Crença do nó sem a contribuição de uma mensagem de entrada.
fn cavity<T: Real>(belief: ArrayView1<T>, incoming: ArrayView1<T>) -> Array1<T> {
    Zip::from(&belief)
        .and(&incoming)
        .map_collect(|&b, &m| if m == T::zero() { T::zero() } else { b / m })
}

/// Estimativa de `log Z` pela energia livre de Bethe.
///
/// ```text
/// H_nós     = Σ_n (grau(n) - 1) · Σ_s b log b
/// U_nós     = -Σ_n Σ_s b · log pot
/// H_arestas = -Σ_e Σ_{s1,s2} b log b
/// U_arestas = -Σ_e Σ_{s1,s2} b · log pot
/// F = (U_nós + U_arestas) - (H_nós + H_arestas);  log Z = -F
/// ```
///
/// As crenças recebem `+ 1e-15` antes do `log` (sem modificar os buffers do chamador).
/// Estados com crença exatamente zero não entram na energia (`0 · log 0 = 0`).
pub fn compute_log_z<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
    node_beliefs: ArrayView2<T>,
    edge_beliefs: ArrayView3<T>,
) -> Result<f64> {
    let m = graph.max_states();
    check_potentials(graph, node_pot, edge_pot)?;
    check_shape("node beliefs", node_beliefs.shape(), graph.n_nodes(), &[m])?;
    check_shape("edge beliefs", edge_beliefs.shape(), graph.n_edges(), &[m, m])?;

    let mut node_energy = 0.0f64;
    let mut node_entropy = 0.0f64;
    for n in 0..graph.n_nodes() {
        let degree = graph.adjacency().degree(n) as f64;
        let mut neg_entropy = 0.0f64;
        let mut expected_log_pot = 0.0f64;
        for s in 0..graph.n_states(n) {
            let raw = node_beliefs[[n, s]].to_acc();
            let b = raw + LOG_Z_EPSILON;
            neg_entropy += b * b.ln();
            if raw != 0.0 {
                expected_log_pot += b * node_pot[[n, s]].to_acc().ln();
            }
        }
        node_entropy += (degree - 1.0) * neg_entropy;
        node_energy -= expected_log_pot;
    }

    let mut edge_energy = 0.0f64;
    let mut edge_entropy = 0.0f64;
    for (e, &(n1, n2)) in graph.edge_ends().iter().enumerate() {
        for s1 in 0..graph.n_states(n1) {
            for s2 in 0..graph.n_states(n2) {
                let raw = edge_beliefs[[e, s1, s2]].to_acc();
                let b = raw + LOG_Z_EPSILON;
                edge_entropy -= b * b.ln();
                if raw != 0.0 {
                    edge_energy -= b * edge_pot[[e, s1, s2]].to_acc().ln();
                }
            }
        }
    }

    let free_energy = (node_energy + edge_energy) - (node_entropy + edge_entropy);
    debug!(free_energy, "energia livre de Bethe calculada");
    Ok(-free_energy)
}

/// Crenças de nós e arestas derivadas de um conjunto de mensagens.
#[derive(Debug, Clone)]
pub struct Beliefs<T> {
    /// `[n_nodes, max_states]`
    pub node: Array2<T>,
    /// `[n_edges, max_states, max_states]`
    pub edge: Array3<T>,
}

impl<T: Real> Beliefs<T> {
    /// Calcula crenças de nós e, em seguida, de arestas.
    pub fn compute(graph: &Graph, pots: &Potentials<T>, messages: ArrayView2<T>) -> Result<Self> {
        let mut node = graph.node_buffer();
        let mut edge = graph.edge_buffer();
        compute_node_beliefs(graph, pots.node.view(), messages, &mut node)?;
        compute_edge_beliefs(graph, pots.edge.view(), node.view(), messages, &mut edge)?;
        Ok(Self { node, edge })
    }

    /// `log Z` de Bethe para estas crenças
    pub fn log_z(&self, graph: &Graph, pots: &Potentials<T>) -> Result<f64> {
        compute_log_z(
            graph,
            pots.node.view(),
            pots.edge.view(),
            self.node.view(),
            self.edge.view(),
        )
    }
}

/// Resultado completo de uma inferência: mensagens finais, crenças e `log Z`.
#[derive(Debug, Clone)]
pub struct Inference<T> {
    pub messages: Array2<T>,
    pub beliefs: Beliefs<T>,
    pub log_z: f64,
    pub convergence: Convergence,
}

/// Inferência completa a partir de mensagens uniformes: inicializa, itera até
/// convergir, calcula crenças e a estimativa de Bethe para `log Z`.
pub fn infer<T: Real>(graph: &Graph, pots: &Potentials<T>, config: &BpConfig) -> Result<Inference<T>> {
    let mut messages = graph.message_buffer();
    init_messages(graph, &mut messages)?;
    let convergence = run_loopy(graph, pots, &mut messages, config)?;
    let beliefs = Beliefs::compute(graph, pots, messages.view())?;
    let log_z = beliefs.log_z(graph, pots)?;
    Ok(Inference {
        messages,
        beliefs,
        log_z,
        convergence,
    })
}

/// Decodifica o rótulo de maior crença de cada nó (1-based).
///
/// Com crenças de max-product, dá a configuração MAP aproximada. Empates ficam
/// com o menor estado.
pub fn decode<T: Real>(graph: &Graph, node_beliefs: ArrayView2<T>) -> Result<Vec<usize>> {
    check_shape("node beliefs", node_beliefs.shape(), graph.n_nodes(), &[graph.max_states()])?;
    Ok((0..graph.n_nodes())
        .map(|n| {
            let row = node_beliefs.slice(s![n, ..graph.n_states(n)]);
            1 + argmax(row)
        })
        .collect())
}

fn argmax<T: Real>(row: ArrayView1<T>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Normaliza `values` para somar 1 (soma acumulada em `f64`).
fn normalize<T: Real>(mut values: ArrayViewMut1<T>, stage: Stage) -> Result<()> {
    let sum: f64 = values.iter().map(|v| v.to_acc()).sum();
    check_sum(sum, stage)?;
    let sum = T::from_acc(sum);
    values.mapv_inplace(|v| v / sum);
    Ok(())
}

/// Soma zero (ou não finita) significa que a precisão numérica se esgotou.
fn check_sum(sum: f64, stage: Stage) -> Result<()> {
    if sum == 0.0 || !sum.is_finite() {
        return Err(GmError::PrecisionExhausted { stage });
    }
    Ok(())
}

fn check_potentials<T>(graph: &Graph, node_pot: ArrayView2<T>, edge_pot: ArrayView3<T>) -> Result<()> {
    let m = graph.max_states();
    check_shape("node potentials", node_pot.shape(), graph.n_nodes(), &[m])?;
    check_shape("edge potentials", edge_pot.shape(), graph.n_edges(), &[m, m])
}

fn check_messages<T>(graph: &Graph, messages: ArrayView2<T>) -> Result<()> {
    check_shape("messages", messages.shape(), 2 * graph.n_edges(), &[graph.max_states()])
}
