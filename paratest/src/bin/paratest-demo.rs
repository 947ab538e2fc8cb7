//! Demo harness: a handful of suites of different sizes.
//!
//! `PARATEST_DEMO_CRASH=1` makes the `Crasher` suite abort its worker process.
//! `PARATEST_DEMO_SLOW=1` makes the `Sleeper` suite take half a minute.

use paratest::prelude::*;
use std::process::ExitCode;

fn arithmetic(ctx: &mut TestContext) {
    ctx.assert_eq(4, 2 + 2);
}

fn ordering(ctx: &mut TestContext) {
    let mut values = vec![3, 1, 2];
    values.sort();
    ctx.assert_eq(vec![1, 2, 3], values);
}

fn strings(ctx: &mut TestContext) {
    ctx.assert("paratest".starts_with("para"), "prefix");
}

fn parsing(ctx: &mut TestContext) {
    ctx.assert_eq(Ok(42), "42".parse::<i32>());
}

fn overflow(ctx: &mut TestContext) {
    ctx.assert_eq(None, u8::MAX.checked_add(1));
}

paratest::suite!("A" => [arithmetic, ordering, strings, parsing, overflow]);

fn single(ctx: &mut TestContext) {
    ctx.pass();
}

paratest::suite!("B" => [single]);

macro_rules! numbered {
    ($($name:ident = $n:expr),* $(,)?) => {
        $(
            fn $name(ctx: &mut TestContext) {
                ctx.assert_eq($n * 2, $n + $n);
            }
        )*
        paratest::suite!("C" => [$($name),*]);
    };
}

numbered!(
    c01 = 1, c02 = 2, c03 = 3, c04 = 4, c05 = 5,
    c06 = 6, c07 = 7, c08 = 8, c09 = 9, c10 = 10,
    c11 = 11, c12 = 12, c13 = 13, c14 = 14, c15 = 15,
    c16 = 16, c17 = 17, c18 = 18, c19 = 19, c20 = 20,
);

fn maybe_abort(ctx: &mut TestContext) {
    if std::env::var("PARATEST_DEMO_CRASH").as_deref() == Ok("1") {
        std::process::abort();
    }
    ctx.pass();
}

paratest::suite!("Crasher" => [maybe_abort]);

fn nap(ctx: &mut TestContext) {
    if std::env::var("PARATEST_DEMO_SLOW").as_deref() == Ok("1") {
        std::thread::sleep(std::time::Duration::from_secs(30));
    }
    ctx.pass();
}

fn wake(ctx: &mut TestContext) {
    ctx.pass();
}

paratest::suite!("Sleeper" => [nap, wake]);

fn main() -> anyhow::Result<ExitCode> {
    paratest::run()
}
