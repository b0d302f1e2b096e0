pub mod category_ranks;
pub mod timeseries_metrics;
