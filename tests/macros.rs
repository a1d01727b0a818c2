/// Assert a snapshot with a set of filters applied.
#[macro_export]
macro_rules! assert_snapshot_filtered {
    ($output:expr, $filters:expr, @$expected:literal) => {
        insta::with_settings!({filters => $filters.clone()}, {
            insta::assert_snapshot!($output, @$expected);
        });
    };
}
