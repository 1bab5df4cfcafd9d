mod analyze;
mod corrections;
mod estimates;
mod food;
mod helpers;

pub(crate) use analyze::{AnalyzeArgs, cmd_analyze, cmd_cached};
pub(crate) use corrections::{cmd_corrections_add, cmd_corrections_list};
pub(crate) use estimates::{cmd_estimates_edit, cmd_estimates_list};
pub(crate) use food::{
    cmd_food_add, cmd_food_list, cmd_food_lookup, cmd_food_search, cmd_food_stats,
    cmd_food_update,
};
