mod listeners;

use proc_macro::TokenStream;

// ============================================================================
// #[listeners] attribute macro
// ============================================================================

/// Attribute macro that turns `#[listen(...)]` methods into queue listeners.
///
/// Place it on an inherent `impl` block. Every method carrying
/// `#[listen(...)]` is registered by the generated
/// `amqp_listen::Listeners::register_listeners` for the impl's self type.
///
/// # Usage
///
/// ```ignore
/// #[listeners]
/// impl OrderListeners {
///     // source only, default connection
///     #[listen("orders")]
///     fn on_created(&self, order: OrderDto) {}
///
///     // source + connection name
///     #[listen("refunds", "billing")]
///     fn on_refund(&self, refund: RefundDto) {}
///
///     // source + options
///     #[listen("audit", ListenOptions::typed::<AuditDto>())]
///     fn on_audit(&self, entry: AuditDto) {}
///
///     // source + options + connection name
///     #[listen("invoices", ListenOptions::typed::<InvoiceDto>(), "billing")]
///     fn on_invoice(&self, invoice: InvoiceDto) {}
/// }
/// ```
///
/// Each handler is stored as a function pointer whose type is taken from the
/// method signature, e.g. `fn(&OrderListeners, OrderDto)` above. `async`
/// and generic methods have no such pointer type and are rejected.
#[proc_macro_attribute]
pub fn listeners(attr: TokenStream, item: TokenStream) -> TokenStream {
    listeners::expand_listeners(attr, item)
}
