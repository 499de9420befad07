use std::{collections::HashSet, sync::Arc};

use tracing::{debug, warn};

use super::{
    response::{DcqlResponse, ResponseCredentialSetOption, ResponseMatch},
    store::Credential,
};

impl DcqlResponse {
    /// Finds the selection that presents exactly `preselected`.
    ///
    /// Used when a platform credential picker ran before the wallet was
    /// invoked. Combinations are enumerated over the option index of every
    /// set, plus one extra "omit" index for optional sets, and only those
    /// with as many members as there are preselected credentials are tried.
    /// Within a combination every member greedily takes its first
    /// preselected, not yet used, credential. The first combination where
    /// every member finds one wins.
    ///
    /// The search is exponential in the number of sets. Queries in practice
    /// carry a handful of sets with a few options each.
    ///
    /// Returns `None` if no combination reproduces `preselected`; callers
    /// fall back to asking the user.
    pub fn find_combination(&self, preselected: &[Credential]) -> Option<Vec<Arc<ResponseMatch>>> {
        let wanted: HashSet<&Credential> = preselected.iter().collect();
        let sets = self.credential_sets();
        let radices: Vec<usize> = sets
            .iter()
            .map(|set| set.options().len() + usize::from(set.is_optional()))
            .collect();

        let mut indices = vec![0usize; sets.len()];
        loop {
            let chosen: Vec<&ResponseCredentialSetOption> = sets
                .iter()
                .zip(&indices)
                .filter_map(|(set, index)| set.options().get(*index))
                .collect();

            let member_count: usize = chosen.iter().map(|option| option.members().len()).sum();
            if member_count == wanted.len() {
                if let Some(selection) = assign(&chosen, &wanted) {
                    debug!(?indices, "Reconciled preselected credentials");
                    return Some(selection);
                }
            }

            if !advance(&mut indices, &radices) {
                break;
            }
        }

        warn!(
            count = preselected.len(),
            "No combination matches the preselected credentials"
        );
        None
    }
}

fn assign(
    chosen: &[&ResponseCredentialSetOption],
    wanted: &HashSet<&Credential>,
) -> Option<Vec<Arc<ResponseMatch>>> {
    let mut used: HashSet<&Credential> = HashSet::new();
    let mut selection = Vec::new();

    for member in chosen.iter().flat_map(|option| option.members()) {
        let found = member.matches().iter().find(|candidate| {
            wanted.contains(candidate.credential()) && !used.contains(candidate.credential())
        })?;
        used.insert(found.credential());
        selection.push(Arc::clone(found));
    }

    Some(selection)
}

/// Steps `indices` to the next combination, last position fastest.
/// Returns `false` once every combination has been visited.
fn advance(indices: &mut [usize], radices: &[usize]) -> bool {
    for position in (0..indices.len()).rev() {
        indices[position] += 1;
        if indices[position] < radices[position] {
            return true;
        }
        indices[position] = 0;
    }
    false
}
