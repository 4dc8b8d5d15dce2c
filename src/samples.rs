//! Sample domain: greeting activities chained over a list of cities.

use crate::runtime::activity::{ActivityContext, ActivityRegistry};
use crate::ActivityPlan;

pub const SAY_HELLO: &str = "SayHello";

/// `SayHello(name) -> "Hello {name}!"`.
pub async fn say_hello(ctx: ActivityContext, name: String) -> Result<String, String> {
    ctx.trace_info(format!("Saying hello to {name}."));
    Ok(format!("Hello {name}!"))
}

/// Registry holding the sample activities.
pub fn activities() -> ActivityRegistry {
    ActivityRegistry::builder().register(SAY_HELLO, say_hello).build()
}

/// The default plan: greet Tokyo, Seattle and London, in that order.
pub fn hello_cities_plan() -> ActivityPlan {
    ["Tokyo", "Seattle", "London"]
        .into_iter()
        .fold(ActivityPlan::new(), |plan, city| plan.then(SAY_HELLO, city))
}
