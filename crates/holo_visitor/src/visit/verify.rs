use super::{
    ClusterView, ResultCode, ReturnCode, ShardOwnership, VisitRequest, NO_FIELDS_FIELD_SET,
};

/// Check that `request` may run on this coordinator.
///
/// Checks run in order and stop at the first failure:
/// 1. a coordinator is available (`NotReady`);
/// 2. the request names a super-shard and at most one cursor
///    (`IllegalParameters`);
/// 3. the super-shard width matches the distribution bits, unless a document
///    selection narrows the visit (`WrongDistribution`);
/// 4. this coordinator owns the super-shard in both topologies
///    (`WrongDistribution` with the non-owning topology);
/// 5. the field set is not the "no fields" marker (`IllegalParameters`);
/// 6. read-for-write visits cover exactly one shard per round
///    (`IllegalParameters`).
pub(super) fn verify_request(
    request: &VisitRequest,
    cluster: &dyn ClusterView,
) -> Result<(), ReturnCode> {
    if !cluster.has_available_coordinators() {
        return Err(ReturnCode::new(
            ResultCode::NotReady,
            "no coordinator nodes are available",
        ));
    }

    let super_shard = match request.shards.as_slice() {
        [] => {
            return Err(ReturnCode::new(
                ResultCode::IllegalParameters,
                "no shards in visit request",
            ))
        }
        [super_shard] | [super_shard, _] => *super_shard,
        _ => {
            return Err(ReturnCode::new(
                ResultCode::IllegalParameters,
                "visit request must carry a super-shard and at most one progress shard",
            ))
        }
    };

    if request.document_selection.is_empty()
        && super_shard.used_bits() != cluster.distribution_bits()
    {
        return Err(ReturnCode::new(
            ResultCode::WrongDistribution,
            cluster.topology_description(),
        ));
    }

    if let ShardOwnership::NotOwned { topology } = cluster.check_ownership(&super_shard) {
        return Err(ReturnCode::new(ResultCode::WrongDistribution, topology));
    }

    if request.field_set == NO_FIELDS_FIELD_SET {
        return Err(ReturnCode::new(
            ResultCode::IllegalParameters,
            "field set '[none]' is not allowed for visiting",
        ));
    }

    if request.is_read_for_write() && request.max_shards_per_round != 1 {
        return Err(ReturnCode::new(
            ResultCode::IllegalParameters,
            format!(
                "read-for-write visits must cover exactly one shard per round, got {}",
                request.max_shards_per_round
            ),
        ));
    }

    Ok(())
}
