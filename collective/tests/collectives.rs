use std::future::Future;

use collective::{
    CollectiveErr, DistributedGather, ProcessGroup, Solo, all_reduce_mean, concat_all_gather,
    in_memory,
};
use futures::future::try_join_all;
use ndarray::{ArrayD, IxDyn, arr1, arr2};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

type Group = collective::StarGroup<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Runs `f` once per simulated rank, each on its own task, and returns the
/// results sorted by rank.
async fn run_ranks<F, Fut, T>(world_size: usize, f: F) -> Vec<T>
where
    F: Fn(Group) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles = in_memory(world_size).into_iter().map(|g| tokio::spawn(f(g)));
    try_join_all(handles).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn groups_know_their_place() {
    let places = run_ranks(3, |g| async move { (g.rank(), g.world_size()) }).await;
    assert_eq!(places, vec![(0, 3), (1, 3), (2, 3)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn barrier_releases_every_rank() {
    let done = run_ranks(4, |mut g| async move {
        g.barrier().await.unwrap();
        g.barrier().await.unwrap();
        g.disconnect().await.unwrap();
        true
    })
    .await;

    assert!(done.into_iter().all(|d| d));
}

#[tokio::test(flavor = "multi_thread")]
async fn all_reduce_sums_elementwise() {
    let sums = run_ranks(3, |mut g| async move {
        let r = g.rank() as f64;
        let mut values = vec![r, 10.0 * r, 1.0];
        g.all_reduce_sum(&mut values).await.unwrap();
        values
    })
    .await;

    for values in sums {
        assert_eq!(values, vec![3.0, 30.0, 3.0]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn all_reduce_is_bit_identical_on_every_rank() {
    let sums = run_ranks(4, |mut g| async move {
        let r = g.rank() as f64;
        let mut values = vec![0.1 + r * 1e-9, 1.0 / (r + 3.0)];
        g.all_reduce_sum(&mut values).await.unwrap();
        values.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    })
    .await;

    assert!(sums.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn all_gather_concatenates_in_rank_order() {
    let gathered = run_ranks(3, |mut g| async move {
        let r = g.rank() as f32;
        g.all_gather(&[r, r + 0.5]).await.unwrap()
    })
    .await;

    for out in gathered {
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn length_mismatch_fails_every_rank() {
    let results = run_ranks(3, |mut g| async move {
        let len = if g.rank() == 2 { 3 } else { 2 };
        let mut values = vec![1.0; len];
        g.all_reduce_sum(&mut values).await
    })
    .await;

    assert!(matches!(
        results[0],
        Err(CollectiveErr::LengthMismatch { rank: 2, got: 3, expected: 2, .. })
    ));
    assert!(matches!(results[1], Err(CollectiveErr::Remote { rank: 0, .. })));
    assert!(matches!(results[2], Err(CollectiveErr::Remote { rank: 0, .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn all_reduce_mean_averages_scalars() {
    let means = run_ranks(4, |mut g| async move {
        let loss = g.rank() as f64 + 1.0;
        all_reduce_mean(&mut g, loss).await.unwrap()
    })
    .await;

    assert!(means.into_iter().all(|m| m == 2.5));
}

#[tokio::test(flavor = "multi_thread")]
async fn concat_all_gather_stacks_along_the_first_axis() {
    let gathered = run_ranks(2, |mut g| async move {
        let r = g.rank() as f32;
        let local = arr2(&[[r, r], [r + 10.0, r + 10.0]]).into_dyn();
        concat_all_gather(&mut g, local.view()).await.unwrap()
    })
    .await;

    let expected = arr2(&[[0.0, 0.0], [10.0, 10.0], [1.0, 1.0], [11.0, 11.0]]).into_dyn();
    for out in gathered {
        assert_eq!(out, expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn gather_routes_gradients_back_to_their_shard() {
    // rank r contributes x_r = [r + 1] and its loss is (r + 1) * sum(gathered),
    // so d loss_r / d gathered = [r + 1, r + 1] and the total over ranks is [3, 3]
    let grads = run_ranks(2, |mut g| async move {
        let r = g.rank();
        let mut gather = DistributedGather::new();

        let local = arr1(&[r as f32 + 1.0]).into_dyn();
        let gathered = gather.gather(&mut g, local.view()).await.unwrap();
        assert_eq!(gathered, arr1(&[1.0, 2.0]).into_dyn());

        let upstream = ArrayD::from_elem(IxDyn(&[2]), r as f32 + 1.0);
        gather.scatter_grad(&mut g, upstream.view()).await.unwrap()
    })
    .await;

    assert_eq!(grads[0], arr1(&[3.0]).into_dyn());
    assert_eq!(grads[1], arr1(&[3.0]).into_dyn());
}

#[tokio::test(flavor = "multi_thread")]
async fn scatter_grad_picks_each_ranks_slot() {
    let grads = run_ranks(2, |mut g| async move {
        let mut gather = DistributedGather::new();
        let local = arr1(&[0.0f32, 0.0]).into_dyn();
        gather.gather(&mut g, local.view()).await.unwrap();

        let upstream = arr1(&[1.0f32, 2.0, 3.0, 4.0]).into_dyn();
        gather.scatter_grad(&mut g, upstream.view()).await.unwrap()
    })
    .await;

    assert_eq!(grads[0], arr1(&[2.0, 4.0]).into_dyn());
    assert_eq!(grads[1], arr1(&[6.0, 8.0]).into_dyn());
}

#[tokio::test]
async fn scatter_grad_rejects_foreign_shapes() {
    let mut g = Solo;
    let mut gather = DistributedGather::new();

    let upstream = arr1(&[1.0f32, 2.0]).into_dyn();
    let err = gather.scatter_grad(&mut g, upstream.view()).await.unwrap_err();
    assert!(matches!(err, CollectiveErr::ShapeMismatch { .. }));

    let local = arr1(&[1.0f32, 2.0, 3.0]).into_dyn();
    gather.gather(&mut g, local.view()).await.unwrap();

    let err = gather.scatter_grad(&mut g, upstream.view()).await.unwrap_err();
    assert!(matches!(
        err,
        CollectiveErr::ShapeMismatch { ref got, ref expected, .. } if got == &[2] && expected == &[3]
    ));
}

#[tokio::test]
async fn solo_collectives_are_the_identity() {
    let mut g = Solo;
    let mut gather = DistributedGather::new();

    let local = arr1(&[4.0f32, 5.0]).into_dyn();
    let out = gather.gather(&mut g, local.view()).await.unwrap();
    assert_eq!(out, local);

    let grad = gather.scatter_grad(&mut g, out.view()).await.unwrap();
    assert_eq!(grad, local);

    assert_eq!(all_reduce_mean(&mut g, 0.25).await.unwrap(), 0.25);
}
