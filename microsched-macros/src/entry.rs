use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

/// Config used in case of the attribute not being able to build a valid config
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    worker_threads: WorkerThreads::Fixed(1),
};

/// For quickstart on how this works, let's analyze this example:
///
/// ```rust,no_run
/// # use microsched::Scheduler;
/// #[microsched::test(worker_threads = 2)]
/// fn spawns(scheduler: &Scheduler) {
///     assert_eq!(scheduler.worker_count(), 2);
/// }
/// ```
///
/// `args` holds everything between the attribute parentheses,
/// `worker_threads = 2`, and `item` the function it is attached to. The
/// function loses its argument and gets a body building a pool and a
/// scheduler, binding `scheduler` to the latter, running the original body as a
/// closure and tearing both down.
pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    // If any of the steps for this macro fail, we still want to expand to an item that is as close
    // to the expected output as possible. This helps out IDEs such that completions and other
    // related features keep working.
    let mut input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let scheduler_arg = match input.take_scheduler_arg() {
        Ok(arg) => arg,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args))
    };

    match config {
        Ok(config) => parse_knobs(input, scheduler_arg, config),
        Err(e) => token_stream_with_error(
            parse_knobs(input, scheduler_arg, DEFAULT_ERROR_CONFIG),
            e,
        ),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WorkerThreads {
    Fixed(usize),
    Hardware,
}

struct FinalConfig {
    worker_threads: WorkerThreads,
}

#[derive(Default)]
struct ConfigBuilder {
    worker_threads: Option<WorkerThreads>,
}

impl ConfigBuilder {
    fn set_worker_threads(
        &mut self,
        worker_threads: syn::Lit,
        span: Span,
    ) -> Result<(), syn::Error> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(
                span,
                "`worker_threads` set multiple times.",
            ));
        }

        let worker_threads = match worker_threads {
            lit @ syn::Lit::Str(_) => {
                let value = parse_string(lit, span, "worker_threads")?;
                if value != "hardware" {
                    let msg = format!(
                        "No such worker count `{value}`. Use an integer or `\"hardware\"`."
                    );
                    return Err(syn::Error::new(span, msg));
                }
                WorkerThreads::Hardware
            }
            lit => match parse_int(lit, span, "worker_threads")? {
                0 => return Err(syn::Error::new(span, "`worker_threads` may not be 0.")),
                n => WorkerThreads::Fixed(n),
            },
        };

        self.worker_threads = Some(worker_threads);
        Ok(())
    }

    fn build(&self) -> FinalConfig {
        FinalConfig {
            worker_threads: self.worker_threads.unwrap_or(WorkerThreads::Fixed(1)),
        }
    }
}

fn build_config(input: &ItemFn, args: AttributeArgs) -> Result<FinalConfig, syn::Error> {
    if let Some(asyncness) = input.sig.asyncness {
        let msg = "the test function must not be `async`, tasks are spawned on the scheduler";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    let mut config = ConfigBuilder::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => {
                        config.set_worker_threads(lit.clone(), syn::spanned::Spanned::span(lit))?;
                    }
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected `worker_threads`",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "worker_threads" => format!("The `{name}` attribute requires an argument."),
                    name => format!(
                        "Unknown attribute {name} is specified; expected `worker_threads`."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config.build())
}

fn parse_knobs(input: ItemFn, scheduler_arg: Option<SchedulerArg>, config: FinalConfig) -> TokenStream {
    // If type mismatch occurs, the current rustc points to the last statement.
    let (last_stmt_start_span, last_stmt_end_span) = {
        let mut last_stmt = input.stmts.last().cloned().unwrap_or_default().into_iter();

        // `Span` on stable Rust has a limitation that only points to the first
        // token, not the whole tokens. We can work around this limitation by
        // using the first/last span of the tokens like
        // `syn::Error::new_spanned` does.
        let start = last_stmt.next().map_or_else(Span::call_site, |t| t.span());
        let end = last_stmt.last().map_or(start, |t| t.span());
        (start, end)
    };

    let mut pool = quote_spanned! {last_stmt_start_span=>
        microsched::pool::Builder::new()
    };

    if let WorkerThreads::Fixed(n) = config.worker_threads {
        pool = quote_spanned! {last_stmt_start_span=> #pool.worker_threads(#n) };
    }

    let output_type = match &input.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
    };

    let bind_scheduler = match scheduler_arg {
        Some(SchedulerArg { pat, ty }) => quote! { let #pat: #ty = &__scheduler; },
        None => quote! { let _ = &__scheduler; },
    };

    let body = input.body();

    // The original body runs in a closure so `return` and `?` leave the body,
    // not the generated function.
    let body = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::redundant_closure_call)]
        {
            let __pool = #pool
                .try_build()
                .expect("Failed building the WorkerPool");
            let __scheduler = microsched::Scheduler::try_new(&__pool)
                .expect("Failed binding the Scheduler");

            let __result = {
                #bind_scheduler
                let body = || -> #output_type #body;
                body()
            };

            __scheduler.shutdown();
            __pool.shutdown().expect("Failed shutting down the WorkerPool");

            return __result;
        }
    };

    let generated_attrs = quote! {
        #[::core::prelude::v1::test]
    };

    input.into_tokens(generated_attrs, body)
}
